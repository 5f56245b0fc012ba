use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Server-wide tunables from `config/server.yaml`. Every field has a
/// default, so a missing file yields a runnable server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub server_name: String,
    pub motd: String,
    pub max_players: usize,
    pub mod_password: Option<String>,
    /// Hub-wide addition to the inter-area movement cooldown.
    pub move_delay_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_name: "An Unnamed Server".to_string(),
            motd: String::new(),
            max_players: 100,
            mod_password: None,
            move_delay_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkEntry {
    pub target: usize,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub target_position: String,
    #[serde(default = "default_true")]
    pub can_peek: bool,
    #[serde(default)]
    pub evidence_gate: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaEntry {
    pub name: String,
    #[serde(default = "default_background")]
    pub background: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default = "default_max_players")]
    pub max_players: i64,
    #[serde(default)]
    pub move_delay_seconds: u64,
    #[serde(default)]
    pub position_lock: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

impl AreaEntry {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            background: default_background(),
            abbreviation: None,
            max_players: default_max_players(),
            move_delay_seconds: 0,
            position_lock: Vec::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackEntry {
    pub name: String,
    /// Seconds; zero means the track never auto-advances the jukebox.
    #[serde(default)]
    pub length: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MusicCategoryEntry {
    pub category: String,
    #[serde(default)]
    pub songs: Vec<TrackEntry>,
}

/// Everything the hub needs from disk, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ServerData {
    pub settings: ServerSettings,
    pub areas: Vec<AreaEntry>,
    pub characters: Vec<String>,
    pub music: Vec<MusicCategoryEntry>,
}

pub fn load(root: &Path) -> Result<ServerData, String> {
    let config_dir = root.join("config");
    let settings: ServerSettings =
        read_yaml(&config_dir.join("server.yaml"))?.unwrap_or_default();
    let areas: Vec<AreaEntry> = read_yaml(&config_dir.join("areas.yaml"))?
        .ok_or_else(|| format!("{} is missing", config_dir.join("areas.yaml").display()))?;
    if areas.is_empty() {
        return Err("areas.yaml defines no areas".to_string());
    }
    for area in &areas {
        for link in &area.links {
            if link.target >= areas.len() {
                return Err(format!(
                    "area '{}' links to out-of-range area {}",
                    area.name, link.target
                ));
            }
        }
    }
    let characters: Vec<String> = read_yaml(&config_dir.join("characters.yaml"))?
        .ok_or_else(|| {
            format!("{} is missing", config_dir.join("characters.yaml").display())
        })?;
    let music: Vec<MusicCategoryEntry> =
        read_yaml(&config_dir.join("music.yaml"))?.unwrap_or_default();
    Ok(ServerData {
        settings,
        areas,
        characters,
        music,
    })
}

/// Reads and parses one YAML file; a missing file is `None`, anything
/// else unreadable or unparseable is an error naming the file.
fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("read {} failed: {}", path.display(), err)),
    };
    serde_yaml::from_str(&data)
        .map(Some)
        .map_err(|err| format!("parse {} failed: {}", path.display(), err))
}

fn default_true() -> bool {
    true
}

fn default_background() -> String {
    "default".to_string()
}

fn default_max_players() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_entries_fill_defaults() {
        let yaml = "
- name: Lobby
- name: Courtroom 1
  background: courtroom
  max_players: 12
  position_lock: [def, pro]
  links:
    - target: 0
      locked: true
      evidence_gate: [0, 2]
";
        let areas: Vec<AreaEntry> = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].background, "default");
        assert_eq!(areas[0].max_players, -1);
        assert!(areas[0].links.is_empty());

        assert_eq!(areas[1].background, "courtroom");
        assert_eq!(areas[1].max_players, 12);
        assert_eq!(areas[1].position_lock, vec!["def", "pro"]);
        let link = &areas[1].links[0];
        assert_eq!(link.target, 0);
        assert!(link.locked);
        assert!(!link.hidden);
        assert!(link.can_peek);
        assert_eq!(link.evidence_gate, vec![0, 2]);
    }

    #[test]
    fn settings_default_when_fields_missing() {
        let settings: ServerSettings = serde_yaml::from_str("motd: hi\n").expect("parse");
        assert_eq!(settings.motd, "hi");
        assert_eq!(settings.max_players, 100);
        assert_eq!(settings.mod_password, None);
        assert_eq!(settings.server_name, "An Unnamed Server");
    }

    #[test]
    fn music_categories_parse_with_lengths() {
        let yaml = "
- category: == Trial ==
  songs:
    - name: objection.mp3
      length: 90
    - name: ambient.mp3
";
        let music: Vec<MusicCategoryEntry> = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(music[0].songs[0].length, 90);
        assert_eq!(music[0].songs[1].length, 0);
    }
}
