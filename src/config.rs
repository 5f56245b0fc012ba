use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub bind_addr: String,
    pub ws_bind_addr: Option<String>,
    pub ws_allowed_origins: Option<Vec<String>>,
    /// Environment overrides applied on top of `config/server.yaml`.
    pub max_players_override: Option<usize>,
    pub mod_password_override: Option<String>,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err(
                "usage: oyez <asset-root> [bind_addr] [ws_bind_addr]".to_string(),
            );
        }

        let root = Path::new(&args[1]).to_path_buf();
        let bind_addr = if args.len() > 2 {
            args[2].clone()
        } else {
            "0.0.0.0:27016".to_string()
        };
        let ws_bind_addr = if args.len() > 3 {
            Some(args[3].clone())
        } else {
            std::env::var("OYEZ_WS_ADDR")
                .ok()
                .and_then(|value| {
                    let trimmed = value.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(trimmed.to_string())
                    }
                })
                .or_else(|| derive_ws_bind_addr(&bind_addr))
        };
        let ws_allowed_origins = std::env::var("OYEZ_WS_ORIGINS").ok().and_then(|value| {
            let entries: Vec<String> = value
                .split(',')
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(|entry| entry.to_string())
                .collect();
            if entries.is_empty() {
                None
            } else {
                Some(entries)
            }
        });
        let max_players_override = std::env::var("OYEZ_MAX_PLAYERS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok());
        let mod_password_override = std::env::var("OYEZ_MOD_PASSWORD")
            .ok()
            .and_then(|value| {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            });
        Ok(Self {
            root,
            bind_addr,
            ws_bind_addr,
            ws_allowed_origins,
            max_players_override,
            mod_password_override,
        })
    }
}

fn derive_ws_bind_addr(bind_addr: &str) -> Option<String> {
    let (host, port_str) = bind_addr.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;
    let ws_port = port.saturating_add(1);
    Some(format!("{host}:{ws_port}"))
}
