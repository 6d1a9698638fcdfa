//! Offline subcommands: `status`, `logs`, `refresh`, `init`.
//!
//! These never talk to the serving process directly. They read the status
//! snapshot and log file the server maintains in the cache directory, and
//! `refresh` drops a marker file the server picks up between upstream
//! messages.

use std::io::{BufRead, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::cli::{Cli, EXIT_CONFIG, EXIT_OK, LOG_FILE};
use crate::config::{cache_dir, load_config};
use crate::gateway::server::REFRESH_MARKER_FILE;
use crate::policy::load_policy;

/// Shows the running gateway's status snapshot.
pub fn run_status(json: bool, server: Option<&str>, pending: bool) -> u8 {
    let Some(path) = cache_dir().map(|dir| dir.join(crate::gateway::server::STATUS_FILE)) else {
        eprintln!("No cache directory available on this platform");
        return EXIT_CONFIG;
    };
    let Ok(contents) = std::fs::read_to_string(&path) else {
        println!("gateway is not running (no status snapshot at {})", path.display());
        return EXIT_OK;
    };
    let Ok(mut document) = serde_json::from_str::<Value>(&contents) else {
        eprintln!("Status snapshot is corrupt: {}", path.display());
        return EXIT_CONFIG;
    };

    if let Some(name) = server {
        if let Some(servers) = document.get_mut("servers").and_then(Value::as_array_mut) {
            servers.retain(|s| s.get("name").and_then(Value::as_str) == Some(name));
            if servers.is_empty() {
                eprintln!("No server named '{name}' in the snapshot");
                return EXIT_CONFIG;
            }
        }
    }

    if json {
        println!("{document}");
        return EXIT_OK;
    }

    if let Some(updated) = document.get("updated_at").and_then(Value::as_u64) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        println!("snapshot age: {}s", now.saturating_sub(updated));
    }
    if let Some(servers) = document.get("servers").and_then(Value::as_array) {
        for entry in servers {
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("?");
            let state = entry.get("state").and_then(Value::as_str).unwrap_or("?");
            let tools = entry.get("tools").and_then(Value::as_u64).unwrap_or(0);
            let mut line = format!("{name:<24} {state:<10} {tools:>4} tools");
            if pending {
                let count = entry.get("pending").and_then(Value::as_u64).unwrap_or(0);
                line.push_str(&format!("  {count:>3} pending"));
            }
            if let Some(err) = entry.get("last_error").and_then(Value::as_str) {
                line.push_str(&format!("  ({err})"));
            }
            println!("{line}");
        }
    }
    if let Some(total) = document.get("total_tools").and_then(Value::as_u64) {
        println!("total tools: {total}");
    }
    EXIT_OK
}

/// Prints (and optionally follows) the gateway log.
pub async fn run_logs(follow: bool, tail: usize, level: Option<&str>) -> u8 {
    let Some(path) = cache_dir().map(|dir| dir.join(LOG_FILE)) else {
        eprintln!("No cache directory available on this platform");
        return EXIT_CONFIG;
    };
    let Ok(file) = std::fs::File::open(&path) else {
        println!("no log file at {}", path.display());
        return EXIT_OK;
    };

    let level_needle = level.map(str::to_uppercase);
    let matches_level = |line: &str| {
        level_needle
            .as_deref()
            .map_or(true, |needle| line.contains(needle))
    };

    let reader = std::io::BufReader::new(&file);
    let lines: Vec<String> = reader
        .lines()
        .map_while(Result::ok)
        .filter(|line| matches_level(line))
        .collect();
    let skip = lines.len().saturating_sub(tail);
    for line in &lines[skip..] {
        println!("{line}");
    }

    if !follow {
        return EXIT_OK;
    }

    // Poll for appended lines; good enough for a tail -f workalike
    let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Ok(len) = std::fs::metadata(&path).map(|m| m.len()) else {
            continue;
        };
        if len <= offset {
            // Truncated or rotated; start over from the top
            if len < offset {
                offset = 0;
            }
            continue;
        }
        let Ok(mut file) = std::fs::File::open(&path) else {
            continue;
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            continue;
        }
        let reader = std::io::BufReader::new(&file);
        for line in reader.lines().map_while(Result::ok) {
            if matches_level(&line) {
                println!("{line}");
            }
        }
        offset = len;
    }
}

/// Validates the config and asks the running gateway to refresh.
pub fn run_refresh(cli: &Cli, server: Option<&str>, force: bool) -> u8 {
    // Surface config mistakes immediately rather than in the server log
    let project_dir = std::env::current_dir().unwrap_or_else(|_| ".".into());
    if let Err(e) = load_config(cli.config.as_deref(), &project_dir) {
        eprintln!("Configuration error: {e}");
        return EXIT_CONFIG;
    }
    if let Err(e) = load_policy(cli.policy.as_deref()) {
        eprintln!("Policy error: {e}");
        return EXIT_CONFIG;
    }

    let Some(dir) = cache_dir() else {
        eprintln!("No cache directory available on this platform");
        return EXIT_CONFIG;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        eprintln!("Cannot create cache directory {}", dir.display());
        return EXIT_CONFIG;
    }

    let marker = serde_json::json!({"server": server, "force": force});
    let path = dir.join(REFRESH_MARKER_FILE);
    if let Err(e) = std::fs::write(&path, marker.to_string()) {
        eprintln!("Cannot write refresh marker: {e}");
        return EXIT_CONFIG;
    }
    match server {
        Some(name) => println!("refresh of '{name}' requested"),
        None => println!("refresh requested"),
    }
    println!("a running gateway picks this up within a couple of seconds");
    EXIT_OK
}

/// Starter config written by `init`.
const STARTER_CONFIG: &str = r#"{
  "mcpServers": {
    "filesystem": {
      "command": "npx",
      "args": ["-y", "@modelcontextprotocol/server-filesystem", "."]
    }
  }
}
"#;

/// Writes a starter `.mcp.json` into the project directory.
pub fn run_init(project: Option<&Path>, force: bool) -> u8 {
    let dir = project.map_or_else(
        || std::env::current_dir().unwrap_or_else(|_| ".".into()),
        Path::to_path_buf,
    );
    let path = dir.join(".mcp.json");

    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return EXIT_CONFIG;
    }
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Cannot create {}: {e}", dir.display());
        return EXIT_CONFIG;
    }
    if let Err(e) = std::fs::write(&path, STARTER_CONFIG) {
        eprintln!("Cannot write {}: {e}", path.display());
        return EXIT_CONFIG;
    }

    println!("wrote {}", path.display());
    println!("add servers under \"mcpServers\", then run `mcp-gateway` to serve");
    EXIT_OK
}
