mod assets;
pub mod admin;
mod config;
pub mod entities;
pub mod net;
pub mod persistence;
pub mod telemetry;
pub mod world;

pub use net::codec::{FrameBuffer, WireMessage};
pub use net::server::{run_server, run_ws_server, spawn_tick_loop, ServerConfig, ServerControl};
pub use world::hub::HubState;

use std::sync::{Arc, Mutex};

pub fn run(args: &[String]) -> Result<(), String> {
    let config = config::AppConfig::from_args(args)?;
    telemetry::logging::init(&config.root)?;
    let summary = assets::scan(&config.root)?;

    let mut data = persistence::store::load(&config.root)?;
    if let Some(max_players) = config.max_players_override {
        data.settings.max_players = max_players;
    }
    if let Some(password) = config.mod_password_override.clone() {
        data.settings.mod_password = Some(password);
    }
    let banlist = persistence::banlist::BanList::load(&config.root)?;

    let track_count: usize = data
        .music
        .iter()
        .map(|category| category.songs.len())
        .sum();
    telemetry::logging::log_server(&format!(
        "asset scan: config={}, save={}, areas={}, characters={}, tracks={}, bans={}",
        summary.config_files,
        summary.save_files,
        data.areas.len(),
        data.characters.len(),
        track_count,
        banlist.len()
    ));
    println!("oyez: asset scan");
    println!("- root: {}", config.root.display());
    println!("- config files: {}", summary.config_files);
    println!("- save files: {}", summary.save_files);
    println!("- areas: {}", data.areas.len());
    println!("- characters: {}", data.characters.len());
    println!("- music tracks: {}", track_count);
    println!("- active bans: {}", banlist.len());
    if data.settings.mod_password.is_none() {
        println!("- moderator login disabled (no password configured)");
    }

    let mut hub_state = world::hub::HubState::new(data, banlist);
    hub_state.set_save_root(config.root.clone());
    let hub = Arc::new(Mutex::new(hub_state));
    let control = Arc::new(ServerControl::new());

    let tick_handle = spawn_tick_loop(Arc::clone(&hub), Arc::clone(&control));
    let server_config = ServerConfig {
        bind_addr: config.bind_addr.clone(),
        ws_bind_addr: config.ws_bind_addr.clone(),
        ws_allowed_origins: config.ws_allowed_origins.clone(),
        ..ServerConfig::default()
    };
    let ws_handle = if server_config.ws_bind_addr.is_some() {
        let ws_config = server_config.clone();
        let ws_hub = Arc::clone(&hub);
        let ws_control = Arc::clone(&control);
        Some(std::thread::spawn(move || {
            run_ws_server(ws_config, ws_hub, ws_control)
        }))
    } else {
        None
    };

    let result = run_server(server_config, hub, Arc::clone(&control));
    control.request_shutdown();

    if let Some(ws_handle) = ws_handle {
        match ws_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => eprintln!("oyez: ws server error: {}", err),
            Err(_) => eprintln!("oyez: ws server thread panicked"),
        }
    }
    if tick_handle.join().is_err() {
        eprintln!("oyez: tick thread panicked");
    }
    result
}
