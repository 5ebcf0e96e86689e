use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the chat gateway", long_about = None)]
struct Cli {
    #[arg(short, long, env = "GATEWAY_ADMIN_URL", default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEWAY_ADMIN_KEY")]
    key: String,

    /// Print the raw JSON instead of the summary view
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Check gateway status and active policy version
    Status,
    /// List clients with a live rate-limit window
    Clients,
    /// Show the active moderation policy
    Policy,
}

impl Commands {
    fn path(self) -> &'static str {
        match self {
            Commands::Status => "/admin/status",
            Commands::Clients => "/admin/clients",
            Commands::Policy => "/admin/policy",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let url = format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path());
    let res = client.get(url).headers(headers).send().await?;
    print_response(cli.command, cli.json, res).await
}

async fn print_response(
    command: Commands,
    raw: bool,
    res: reqwest::Response,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: {}", error_message(status, &body));
        std::process::exit(1);
    }

    let json: Value = serde_json::from_str(&body)?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print!("{}", render(command, &json));
    }
    Ok(())
}

/// Every gateway error body carries an `error` string; anything else
/// (a proxy page, an empty body) falls back to the status line.
fn error_message(status: StatusCode, body: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("unknown status");
    let parsed = serde_json::from_str::<Value>(body).ok();
    match parsed.as_ref().and_then(|v| v.get("error")).and_then(Value::as_str) {
        Some(error) => format!("{error} ({} {reason})", status.as_u16()),
        None if body.trim().is_empty() => format!("Admin API returned {} {reason}", status.as_u16()),
        None => format!("Admin API returned {} {reason}: {}", status.as_u16(), body.trim()),
    }
}

fn render(command: Commands, json: &Value) -> String {
    let mut out = String::new();
    match command {
        Commands::Status => {
            for key in [
                "status",
                "version",
                "uptime_secs",
                "policy_version",
                "moderation_enabled",
                "rate_limit_enabled",
            ] {
                out.push_str(&format!("{key:<20} {}\n", field(json, key)));
            }
        }
        Commands::Clients => {
            out.push_str(&format!(
                "limit {} requests per {} ms, {} tracked\n",
                field(json, "limit"),
                field(json, "window_ms"),
                field(json, "tracked"),
            ));
            out.push_str(&format!(
                "{:<40} {:>6} {:>9} {:>10}\n",
                "CLIENT", "COUNT", "REMAINING", "RESET_MS"
            ));
            for client in json["clients"].as_array().into_iter().flatten() {
                out.push_str(&format!(
                    "{:<40} {:>6} {:>9} {:>10}\n",
                    field(client, "identity"),
                    field(client, "count"),
                    field(client, "remaining"),
                    field(client, "reset_in_ms"),
                ));
            }
        }
        Commands::Policy => {
            out.push_str(&format!("version {}\n", field(json, "version")));
            for category in json["categories"].as_array().into_iter().flatten() {
                out.push_str(&format!("  - {}\n", category.as_str().unwrap_or_default()));
            }
        }
    }
    out
}

fn field(json: &Value, key: &str) -> String {
    match &json[key] {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_field_is_surfaced() {
        let body = json!({ "error": "Invalid or missing admin API key" }).to_string();
        assert_eq!(
            error_message(StatusCode::UNAUTHORIZED, &body),
            "Invalid or missing admin API key (401 Unauthorized)"
        );
    }

    #[test]
    fn test_error_without_json_body() {
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, ""),
            "Admin API returned 502 Bad Gateway"
        );
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, "no route\n"),
            "Admin API returned 404 Not Found: no route"
        );
    }

    #[test]
    fn test_render_clients_table() {
        let body = json!({
            "limit": 10,
            "window_ms": 60000,
            "tracked": 1,
            "clients": [{ "identity": "203.0.113.5", "count": 2, "remaining": 8, "reset_in_ms": 59000 }]
        });
        let out = render(Commands::Clients, &body);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "limit 10 requests per 60000 ms, 1 tracked");
        assert!(lines[2].starts_with("203.0.113.5"));
        assert!(lines[2].ends_with("59000"));
    }

    #[test]
    fn test_render_policy() {
        let body = json!({ "version": "2024.06.1", "categories": ["violence", "fraud"] });
        assert_eq!(
            render(Commands::Policy, &body),
            "version 2024.06.1\n  - violence\n  - fraud\n"
        );
    }
}
