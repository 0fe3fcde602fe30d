use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;

use crate::api::middleware::AppError;
use crate::config::LlmConfig;
use crate::models::{DatabaseType, GeneratedSql, SchemaDocument, TableMetadata};

const DEFAULT_EXPLANATION: &str = "Generated SQL query from natural language input";

/// Turns a natural-language question into SQL for one database.
///
/// The returned SQL is untrusted; callers must pass it through the gate.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(
        &self,
        dialect: DatabaseType,
        schema: &SchemaDocument,
        prompt: &str,
    ) -> Result<GeneratedSql, AppError>;
}

/// OpenAI-compatible chat-completions client
pub struct LlmService {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedPayload {
    #[serde(default)]
    sql: String,
    #[serde(default)]
    explanation: String,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: config.model.clone(),
            http_client: HttpClient::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String, AppError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::LlmService("OpenAI API key not configured".to_string()))?;

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": prompt },
                ],
                "temperature": 0.1,
                "max_tokens": 500,
            }))
            .send()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to generate SQL: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::LlmService(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to parse LLM response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AppError::LlmService("Empty response from OpenAI API".to_string()))
    }
}

#[async_trait]
impl SqlGenerator for LlmService {
    async fn generate_sql(
        &self,
        dialect: DatabaseType,
        schema: &SchemaDocument,
        prompt: &str,
    ) -> Result<GeneratedSql, AppError> {
        let system_prompt = build_system_prompt(dialect, schema);
        let content = self.complete(&system_prompt, prompt).await?;
        let generated = parse_completion(&content)?;
        tracing::info!("Generated {} SQL: {}", dialect, generated.sql);
        Ok(generated)
    }
}

fn dialect_hints(dialect: DatabaseType) -> &'static str {
    match dialect {
        DatabaseType::MySQL => {
            "- For dates, use functions like NOW(), CURDATE(), DATE_SUB()\n\
             - String concatenation uses CONCAT()\n\
             - Quote identifiers with backticks if needed: `table_name`"
        }
        DatabaseType::PostgreSQL => {
            "- For dates, use functions like NOW(), CURRENT_DATE, interval arithmetic\n\
             - String concatenation uses the || operator\n\
             - Quote identifiers with double quotes if needed: \"table_name\""
        }
        DatabaseType::Sqlite => {
            "- For dates, use date(), datetime() and strftime()\n\
             - String concatenation uses the || operator\n\
             - Quote identifiers with double quotes if needed: \"table_name\""
        }
    }
}

fn describe_object(kind: &str, object: &TableMetadata) -> String {
    let columns: Vec<String> = object
        .columns
        .iter()
        .map(|column| {
            let mut desc = format!("{} {}", column.name, column.data_type);
            if column.primary_key {
                desc.push_str(" PRIMARY KEY");
            }
            if !column.nullable {
                desc.push_str(" NOT NULL");
            }
            desc
        })
        .collect();
    format!("{} {} (\n  {}\n)", kind, object.name, columns.join(",\n  "))
}

/// System prompt carrying the schema as pseudo-DDL
pub fn build_system_prompt(dialect: DatabaseType, schema: &SchemaDocument) -> String {
    let schema_description: Vec<String> = schema
        .tables
        .iter()
        .map(|table| describe_object("TABLE", table))
        .chain(schema.views.iter().map(|view| describe_object("VIEW", view)))
        .collect();

    format!(
        r#"You are a SQL expert for {dialect} databases. Generate SQL SELECT queries based on natural language input.

Database Schema:
{schema}

Rules:
1. ONLY generate SELECT statements (no INSERT, UPDATE, DELETE, DROP, etc.)
2. Use explicit column names (avoid SELECT *)
3. Include appropriate WHERE, JOIN, ORDER BY, GROUP BY clauses as needed
4. Use {dialect}-specific SQL syntax:
{hints}
5. Return response as JSON with two fields:
   - "sql": the SQL query (string)
   - "explanation": brief explanation of what the query does (string)

Example response format:
{{
  "sql": "SELECT name, email FROM users WHERE status = 'active' LIMIT 100",
  "explanation": "This query retrieves the name and email of all active users, limited to 100 rows."
}}

User input may be in English or Chinese. Always respond with valid JSON containing SQL and explanation in English."#,
        dialect = dialect,
        schema = schema_description.join("\n"),
        hints = dialect_hints(dialect),
    )
}

/// Parse the model's reply: JSON `{sql, explanation}`, or bare SQL as a fallback.
pub fn parse_completion(content: &str) -> Result<GeneratedSql, AppError> {
    let cleaned = strip_code_fence(content);

    let generated = match serde_json::from_str::<GeneratedPayload>(cleaned) {
        Ok(payload) => GeneratedSql {
            sql: payload.sql.trim().to_string(),
            explanation: payload.explanation,
        },
        Err(_) => GeneratedSql {
            sql: cleaned.to_string(),
            explanation: DEFAULT_EXPLANATION.to_string(),
        },
    };

    if generated.sql.is_empty() {
        return Err(AppError::LlmService("No SQL query generated".to_string()));
    }
    Ok(generated)
}

fn strip_code_fence(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnMetadata;

    fn schema() -> SchemaDocument {
        let columns = vec![
            ColumnMetadata {
                name: "id".into(),
                data_type: "integer".into(),
                nullable: false,
                primary_key: true,
                unique: false,
                default_value: None,
                comment: None,
            },
            ColumnMetadata {
                name: "email".into(),
                data_type: "text".into(),
                nullable: true,
                primary_key: false,
                unique: true,
                default_value: None,
                comment: None,
            },
        ];
        SchemaDocument::new(
            vec![TableMetadata::table("users".into(), "public".into(), columns.clone(), 10)],
            vec![TableMetadata::view("active_users".into(), "public".into(), columns)],
        )
    }

    #[test]
    fn test_system_prompt_describes_schema() {
        let prompt = build_system_prompt(DatabaseType::PostgreSQL, &schema());
        assert!(prompt.contains("You are a SQL expert for postgresql databases"));
        assert!(prompt.contains("TABLE users (\n  id integer PRIMARY KEY NOT NULL,\n  email text\n)"));
        assert!(prompt.contains("VIEW active_users ("));
        assert!(prompt.contains("\"sql\": \"SELECT name, email FROM users"));
    }

    #[test]
    fn test_parse_json_completion() {
        let generated = parse_completion(r#"{"sql": "SELECT id FROM users", "explanation": "All ids"}"#).unwrap();
        assert_eq!(generated.sql, "SELECT id FROM users");
        assert_eq!(generated.explanation, "All ids");
    }

    #[test]
    fn test_parse_fenced_completion() {
        let generated = parse_completion("```json\n{\"sql\": \"SELECT 1\", \"explanation\": \"one\"}\n```").unwrap();
        assert_eq!(generated.sql, "SELECT 1");

        let raw = parse_completion("```sql\nSELECT email FROM users\n```").unwrap();
        assert_eq!(raw.sql, "SELECT email FROM users");
        assert_eq!(raw.explanation, DEFAULT_EXPLANATION);
    }

    #[test]
    fn test_parse_empty_sql_fails() {
        let err = parse_completion(r#"{"sql": "", "explanation": "nothing"}"#).unwrap_err();
        assert!(matches!(err, AppError::LlmService(ref msg) if msg == "No SQL query generated"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let service = LlmService::new(&LlmConfig {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        });
        assert!(!service.is_configured());

        let err = service
            .generate_sql(DatabaseType::Sqlite, &schema(), "how many users?")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LlmService(ref msg) if msg.contains("not configured")));
    }
}
