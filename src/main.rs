use std::io::Read;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use hydrolens::catalog::ProjectContext;
use hydrolens::config::Config;
use hydrolens::engine;
use hydrolens::request::{FetchDataRequest, MultiMetadataRequest, ScanRequest, TableNamesRequest};

/// Deserialize the request into the operation's typed shape; a malformed
/// request is a caller error and keeps the `{"error": ...}` contract.
fn dispatch<T, F>(value: &serde_json::Value, run: F) -> serde_json::Value
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(&T) -> serde_json::Value,
{
    match serde_json::from_value::<T>(value.clone()) {
        Ok(req) => run(&req),
        Err(e) => serde_json::json!({ "error": format!("malformed request: {}", e) }),
    }
}

fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    info!(
        target: "hydrolens",
        "hydrolens starting: data_root='{}', project='{}'",
        config.data_root.display(),
        config.project_folder
    );
    let ctx = ProjectContext::shared(config);

    // One JSON request per invocation, from the argument file or stdin,
    // selected by its "op" field.
    let text = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            println!("{}", serde_json::json!({ "error": format!("malformed request: {}", e) }));
            return Ok(());
        }
    };

    let op = value.get("op").and_then(|v| v.as_str()).unwrap_or("fetch_data");
    let out = match op {
        "scan" => dispatch::<ScanRequest, _>(&value, |r| engine::scan_project(&ctx, r)),
        "table_names" => dispatch::<TableNamesRequest, _>(&value, |r| engine::table_names(&ctx, r)),
        "metadata" => dispatch::<MultiMetadataRequest, _>(&value, |r| engine::multi_metadata(&ctx, r)),
        _ => dispatch::<FetchDataRequest, _>(&value, |r| engine::fetch_data(&ctx, r)),
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
