use crate::entities::evidence::Evidence;
use crate::entities::session::{Session, SessionId, SessionStage};
use crate::net::codec;
use crate::persistence::banlist::{BanList, BanRecord, PairingCache};
use crate::persistence::store::ServerData;
use crate::telemetry::logging;
use crate::world::area::{Area, AreaLink, LockState, PENALTY_MAX};
use crate::world::jukebox::{Jukebox, JukeboxVote, PickRng};
use crate::world::schedule::{DeferredQueue, TaskKey};
use crate::world::timer::{CourtTimer, TimerScope};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const SOFTWARE: &str = "oyez";
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seed value clients feed their stream cipher with; sent obfuscated in
/// the very first frame.
const DECRYPTOR_SEED: &str = "34";

const MOD_CALL_COOLDOWN: Duration = Duration::from_secs(30);
const MUSIC_CHANGE_COOLDOWN: Duration = Duration::from_secs(2);
const CASE_ANNOUNCE_COOLDOWN: Duration = Duration::from_secs(60);

const FEATURE_LIST: [&str; 11] = [
    "yellowtext",
    "customobjections",
    "flipping",
    "fastloading",
    "noencryption",
    "deskmod",
    "evidence",
    "cccc_ic_support",
    "arup",
    "casing_alerts",
    "modcall_reason",
];

/// Moderation toggles applied to other sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModFlag {
    IcMute,
    OocMute,
    JudgeControls,
    Dj,
    Blind,
}

impl ModFlag {
    fn describe(&self, value: bool) -> &'static str {
        match (self, value) {
            (ModFlag::IcMute, true) => "You have been muted by a moderator.",
            (ModFlag::IcMute, false) => "You have been unmuted.",
            (ModFlag::OocMute, true) => "Your out-of-character chat has been muted.",
            (ModFlag::OocMute, false) => "Your out-of-character chat has been unmuted.",
            (ModFlag::JudgeControls, true) => "A moderator took away your judge controls.",
            (ModFlag::JudgeControls, false) => "Your judge controls have been restored.",
            (ModFlag::Dj, true) => "A moderator took away your music privileges.",
            (ModFlag::Dj, false) => "Your music privileges have been restored.",
            (ModFlag::Blind, true) => "You have been blinded to dialogue.",
            (ModFlag::Blind, false) => "You can see dialogue again.",
        }
    }
}

/// One parsed line of dialogue. The first fifteen fields are common to
/// every client generation; later fields arrive only from newer clients
/// and are echoed back exactly when present.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IcMessage {
    pub desk_mod: String,
    pub preanim: String,
    pub folder: String,
    pub anim: String,
    pub text: String,
    pub pos: String,
    pub sfx: String,
    pub emote_mod: i64,
    pub char_id: i64,
    pub sfx_delay: i64,
    pub shout: String,
    pub evidence: i64,
    pub flip: i64,
    pub realization: i64,
    pub text_color: i64,
    pub showname: Option<String>,
    pub pair_char_id: Option<String>,
    pub pair_offset: Option<String>,
    pub noninterrupting_preanim: Option<String>,
    pub sfx_looping: Option<String>,
    pub screenshake: Option<String>,
    pub frames_shake: Option<String>,
    pub frames_realization: Option<String>,
    pub frames_sfx: Option<String>,
    pub additive: Option<String>,
    pub effect: Option<String>,
}

pub const IC_CORE_FIELDS: usize = 15;
const IC_MAX_FIELDS: usize = 26;

impl IcMessage {
    /// Accepts the longest recognized prefix of the ordered field list;
    /// anything past the newest known field is ignored.
    pub fn from_args(args: &[String]) -> Option<Self> {
        if args.len() < IC_CORE_FIELDS {
            return None;
        }
        let int = |idx: usize| -> Option<i64> { args[idx].trim().parse::<i64>().ok() };
        let ext = |idx: usize| -> Option<String> {
            if idx < args.len().min(IC_MAX_FIELDS) {
                Some(args[idx].clone())
            } else {
                None
            }
        };
        Some(Self {
            desk_mod: args[0].clone(),
            preanim: args[1].clone(),
            folder: args[2].clone(),
            anim: args[3].clone(),
            text: args[4].clone(),
            pos: args[5].clone(),
            sfx: args[6].clone(),
            emote_mod: int(7)?,
            char_id: int(8)?,
            sfx_delay: int(9)?,
            shout: args[10].clone(),
            evidence: int(11)?,
            flip: int(12)?,
            realization: int(13)?,
            text_color: int(14)?,
            showname: ext(15),
            pair_char_id: ext(16),
            pair_offset: ext(17),
            noninterrupting_preanim: ext(18),
            sfx_looping: ext(19),
            screenshake: ext(20),
            frames_shake: ext(21),
            frames_realization: ext(22),
            frames_sfx: ext(23),
            additive: ext(24),
            effect: ext(25),
        })
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.desk_mod.clone(),
            self.preanim.clone(),
            self.folder.clone(),
            self.anim.clone(),
            self.text.clone(),
            self.pos.clone(),
            self.sfx.clone(),
            self.emote_mod.to_string(),
            self.char_id.to_string(),
            self.sfx_delay.to_string(),
            self.shout.clone(),
            self.evidence.to_string(),
            self.flip.to_string(),
            self.realization.to_string(),
            self.text_color.to_string(),
        ];
        for field in [
            &self.showname,
            &self.pair_char_id,
            &self.pair_offset,
            &self.noninterrupting_preanim,
            &self.sfx_looping,
            &self.screenshake,
            &self.frames_shake,
            &self.frames_realization,
            &self.frames_sfx,
            &self.additive,
            &self.effect,
        ] {
            match field {
                Some(value) => args.push(value.clone()),
                None => break,
            }
        }
        args
    }
}

#[derive(Clone, Debug)]
pub struct HubOptions {
    pub server_name: String,
    pub motd: String,
    pub max_players: usize,
    pub mod_password: Option<String>,
    /// Hub-wide contribution to the inter-area movement cooldown.
    pub move_delay_seconds: u64,
}

#[derive(Clone, Debug)]
struct MusicEntry {
    name: String,
    length: i64,
}

/// The whole mutable server: sessions, the area graph, rosters and
/// deferred work. Connection threads mutate it under one mutex, so
/// turns never interleave mid-command.
pub struct HubState {
    options: HubOptions,
    areas: Vec<Area>,
    sessions: HashMap<SessionId, Session>,
    characters: Vec<String>,
    music_categories: Vec<(String, Vec<MusicEntry>)>,
    pub banlist: BanList,
    pairings: PairingCache,
    pub schedule: DeferredQueue,
    global_timer: CourtTimer,
    rng: PickRng,
    next_session_id: u32,
    /// Asset root for writing the ban list back; absent in unit tests.
    save_root: Option<PathBuf>,
}

impl HubState {
    pub fn new(data: ServerData, banlist: BanList) -> Self {
        let options = HubOptions {
            server_name: data.settings.server_name,
            motd: data.settings.motd,
            max_players: data.settings.max_players,
            mod_password: data.settings.mod_password,
            move_delay_seconds: data.settings.move_delay_seconds,
        };
        let mut areas = Vec::with_capacity(data.areas.len());
        for (id, entry) in data.areas.into_iter().enumerate() {
            let mut area = Area::new(id, &entry.name, &entry.background);
            if let Some(abbreviation) = entry.abbreviation {
                area.abbreviation = abbreviation;
            }
            area.max_players = entry.max_players;
            area.move_delay_seconds = entry.move_delay_seconds;
            area.position_lock = entry.position_lock;
            for link in entry.links {
                area.links.insert(
                    link.target,
                    AreaLink {
                        locked: link.locked,
                        hidden: link.hidden,
                        target_position: link.target_position,
                        can_peek: link.can_peek,
                        evidence_gate: link.evidence_gate,
                    },
                );
            }
            areas.push(area);
        }
        let music_categories = data
            .music
            .into_iter()
            .map(|category| {
                let entries = category
                    .songs
                    .into_iter()
                    .map(|song| MusicEntry {
                        name: song.name,
                        length: song.length,
                    })
                    .collect();
                (category.category, entries)
            })
            .collect();
        Self {
            options,
            areas,
            sessions: HashMap::new(),
            characters: data.characters,
            music_categories,
            banlist,
            pairings: PairingCache::new(1024),
            schedule: DeferredQueue::new(),
            global_timer: CourtTimer::new(),
            rng: PickRng::from_time(),
            next_session_id: 0,
            save_root: None,
        }
    }

    pub fn set_save_root(&mut self, root: PathBuf) {
        self.save_root = Some(root);
    }

    fn persist_banlist(&self) {
        if let Some(root) = &self.save_root {
            if let Err(err) = self.banlist.save(root) {
                logging::log_error(&format!("banlist save failed: {}", err));
            }
        }
    }

    #[cfg(test)]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = PickRng::from_seed(seed);
        self
    }

    pub fn server_name(&self) -> &str {
        &self.options.server_name
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn area(&self, id: usize) -> Option<&Area> {
        self.areas.get(id)
    }

    pub fn area_mut(&mut self, id: usize) -> Option<&mut Area> {
        self.areas.get_mut(id)
    }

    fn require_session(&self, id: SessionId) -> Result<&Session, String> {
        self.sessions
            .get(&id)
            .ok_or_else(|| "unknown session".to_string())
    }

    fn require_area(&self, id: usize) -> Result<&Area, String> {
        self.areas.get(id).ok_or_else(|| "No such area.".to_string())
    }

    pub fn joined_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.is_joined())
            .count()
    }

    pub fn character_name(&self, character: Option<usize>) -> String {
        match character.and_then(|id| self.characters.get(id)) {
            Some(name) => name.clone(),
            None => "Spectator".to_string(),
        }
    }

    pub fn area_id_by_name(&self, name: &str) -> Option<usize> {
        self.areas
            .iter()
            .find(|area| {
                area.name.eq_ignore_ascii_case(name)
                    || area.abbreviation.eq_ignore_ascii_case(name)
            })
            .map(|area| area.id)
    }

    fn track_length(&self, track: &str) -> Option<i64> {
        self.music_categories
            .iter()
            .flat_map(|(_, entries)| entries.iter())
            .find(|entry| entry.name == track)
            .map(|entry| entry.length)
    }

    // ---- session lifecycle -------------------------------------------------

    /// Creates a session for a freshly accepted transport and queues
    /// the cipher-seed greeting.
    pub fn register_session(&mut self, ip: IpAddr) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        let session = Session::new(id, ip);
        logging::log_server(&format!("session {} connected from {}", id, session.ipid));
        self.sessions.insert(id, session);
        let seed = codec::cipher_encode(DECRYPTOR_SEED);
        self.send(id, "decryptor", &[seed]);
        id
    }

    /// Tears a session down: area occupancy, stewardship, invites and
    /// jukebox votes all release, and everyone still around hears about
    /// the freed character.
    pub fn handle_disconnect(&mut self, id: SessionId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let was_joined = session.is_joined();
        let area_id = session.area_id;
        for area in &mut self.areas {
            area.remove_occupant(id);
            area.owners.remove(&id);
            area.invite_list.remove(&id);
            area.jukebox.revoke_vote(id);
        }
        logging::log_server(&format!(
            "session {} ({}) disconnected",
            id, session.ipid
        ));
        if was_joined {
            self.send_chars_check(area_id);
            self.arup_players();
            self.arup_stewards();
            self.broadcast_player_count();
        }
    }

    /// Drains the frames queued for one connection. The flag asks the
    /// transport to close once everything is written.
    pub fn take_outbox(&mut self, id: SessionId) -> (Vec<String>, bool) {
        match self.sessions.get_mut(&id) {
            Some(session) => (
                std::mem::take(&mut session.outbox),
                session.close_after_flush,
            ),
            None => (Vec::new(), true),
        }
    }

    // ---- frame plumbing ----------------------------------------------------

    fn queue_frame(&mut self, id: SessionId, frame: String) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.queue_frame(frame);
        }
    }

    pub fn send(&mut self, id: SessionId, verb: &str, args: &[String]) {
        let frame = codec::encode_frame(verb, args);
        self.queue_frame(id, frame);
    }

    pub fn send_host_message(&mut self, id: SessionId, text: &str) {
        let name = self.options.server_name.clone();
        self.send(id, "CT", &[name, text.to_string()]);
    }

    /// Snapshot of an area's occupants, taken before any per-target
    /// side effect runs.
    fn area_targets(&self, area_id: usize) -> Vec<SessionId> {
        self.areas
            .get(area_id)
            .map(|area| area.occupants().to_vec())
            .unwrap_or_default()
    }

    fn joined_targets(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.is_joined())
            .map(|session| session.id)
            .collect()
    }

    pub fn broadcast_area(&mut self, area_id: usize, verb: &str, args: &[String]) {
        let frame = codec::encode_frame(verb, args);
        for target in self.area_targets(area_id) {
            self.queue_frame(target, frame.clone());
        }
    }

    pub fn broadcast_joined(&mut self, verb: &str, args: &[String]) {
        let frame = codec::encode_frame(verb, args);
        for target in self.joined_targets() {
            self.queue_frame(target, frame.clone());
        }
    }

    pub fn broadcast_area_host_message(&mut self, area_id: usize, text: &str) {
        let name = self.options.server_name.clone();
        self.broadcast_area(area_id, "CT", &[name, text.to_string()]);
    }

    fn broadcast_scope(&mut self, scope: TimerScope, verb: &str, args: &[String]) {
        match scope {
            TimerScope::Global => self.broadcast_joined(verb, args),
            TimerScope::Area { area, .. } => self.broadcast_area(area, verb, args),
        }
    }

    pub fn broadcast_player_count(&mut self) {
        let args = vec![
            self.joined_count().to_string(),
            self.options.max_players.to_string(),
        ];
        self.broadcast_joined("PN", &args);
    }

    // ---- area relay updates ------------------------------------------------

    pub fn arup_players(&mut self) {
        let mut args = vec!["0".to_string()];
        args.extend(self.areas.iter().map(|area| area.occupant_count().to_string()));
        self.broadcast_joined("ARUP", &args);
    }

    pub fn arup_statuses(&mut self) {
        let mut args = vec!["1".to_string()];
        args.extend(self.areas.iter().map(|area| area.lock.label().to_string()));
        self.broadcast_joined("ARUP", &args);
    }

    pub fn arup_stewards(&mut self) {
        let mut args = vec!["2".to_string()];
        for area in &self.areas {
            let mut names: Vec<String> = area
                .owners
                .iter()
                .filter_map(|owner| self.sessions.get(owner))
                .map(|session| self.character_name(session.character))
                .collect();
            names.sort();
            if names.is_empty() {
                args.push("FREE".to_string());
            } else {
                args.push(names.join(", "));
            }
        }
        self.broadcast_joined("ARUP", &args);
    }

    pub fn arup_locks(&mut self) {
        let mut args = vec!["3".to_string()];
        args.extend(self.areas.iter().map(|area| {
            match area.lock {
                LockState::Free => "FREE".to_string(),
                LockState::Spectatable => "SPECTATABLE".to_string(),
                LockState::Locked => "LOCKED".to_string(),
            }
        }));
        self.broadcast_joined("ARUP", &args);
    }

    fn arup_all(&mut self) {
        self.arup_players();
        self.arup_statuses();
        self.arup_stewards();
        self.arup_locks();
    }

    // ---- handshake ---------------------------------------------------------

    pub fn handle_handshake(&mut self, id: SessionId, hdid: &str) {
        let (ipid, stage) = match self.sessions.get(&id) {
            Some(session) => (session.ipid.clone(), session.stage),
            None => return,
        };
        if stage != SessionStage::Handshaking {
            return;
        }
        self.pairings.record(&ipid, hdid);
        let mut ban_reason = self
            .banlist
            .reason_for(&ipid, hdid)
            .map(|reason| reason.to_string());
        if ban_reason.is_none() {
            // Ban evasion check: any hardware id previously seen from
            // this address carrying a ban taints the whole pairing.
            for paired in self.pairings.hdids_for(&ipid) {
                if let Some(reason) = self.banlist.reason_for("", &paired) {
                    ban_reason = Some(reason.to_string());
                    break;
                }
            }
        }
        if let Some(reason) = ban_reason {
            logging::log_mod(&format!(
                "rejected banned session {} ({} / {}): {}",
                id, ipid, hdid, reason
            ));
            self.send(id, "BD", &[reason]);
            if let Some(session) = self.sessions.get_mut(&id) {
                session.close_after_flush = true;
            }
            return;
        }
        if self.joined_count() >= self.options.max_players {
            self.send_host_message(id, "The server is full.");
            if let Some(session) = self.sessions.get_mut(&id) {
                session.close_after_flush = true;
            }
            return;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.hdid = hdid.to_string();
            session.stage = SessionStage::Joining;
        }
        self.send(
            id,
            "ID",
            &[
                id.to_string(),
                SOFTWARE.to_string(),
                SOFTWARE_VERSION.to_string(),
            ],
        );
        let count = self.joined_count().to_string();
        let limit = self.options.max_players.to_string();
        self.send(id, "PN", &[count, limit]);
    }

    pub fn handle_software_id(&mut self, id: SessionId, software: &str, version: &str) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.software = software.to_string();
            session.software_version = version.to_string();
        }
        logging::log_server(&format!(
            "session {} identifies as {} {}",
            id, software, version
        ));
        let features: Vec<String> = FEATURE_LIST.iter().map(|f| f.to_string()).collect();
        self.send(id, "FL", &features);
    }

    fn music_list_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.areas.iter().map(|area| area.name.clone()).collect();
        for (category, entries) in &self.music_categories {
            args.push(category.clone());
            args.extend(entries.iter().map(|entry| entry.name.clone()));
        }
        args
    }

    pub fn send_resource_counts(&mut self, id: SessionId) {
        let args = vec![
            self.characters.len().to_string(),
            "0".to_string(),
            self.music_list_args().len().to_string(),
        ];
        self.send(id, "SI", &args);
    }

    pub fn send_character_roster(&mut self, id: SessionId) {
        let names = self.characters.clone();
        self.send(id, "SC", &names);
    }

    pub fn send_music_list(&mut self, id: SessionId) {
        let args = self.music_list_args();
        self.send(id, "SM", &args);
    }

    /// Final step of the join handshake: the session lands in area 0
    /// as a spectator.
    pub fn finish_join(&mut self, id: SessionId) {
        let ipid = match self.sessions.get(&id) {
            Some(session) if session.stage == SessionStage::Joining => session.ipid.clone(),
            _ => return,
        };
        if let Some(session) = self.sessions.get_mut(&id) {
            session.stage = SessionStage::Joined;
            session.area_id = 0;
        }
        if let Some(area) = self.areas.get_mut(0) {
            area.add_occupant(id);
        }
        let background = self
            .areas
            .first()
            .map(|area| area.background.clone())
            .unwrap_or_default();
        self.send_chars_check(0);
        self.send(id, "BN", &[background]);
        self.send_evidence_list_to(id);
        self.send(id, "MM", &["1".to_string()]);
        self.send(id, "DONE", &[]);
        self.arup_all();
        self.broadcast_player_count();
        let motd = self.options.motd.clone();
        if !motd.is_empty() {
            self.send_host_message(id, &motd);
        }
        logging::log_server(&format!("session {} ({}) joined", id, ipid));
    }

    // ---- character selection -----------------------------------------------

    fn character_taken(&self, area_id: usize, character: usize, exclude: SessionId) -> bool {
        self.area_targets(area_id).iter().any(|occupant| {
            *occupant != exclude
                && self
                    .sessions
                    .get(occupant)
                    .and_then(|session| session.character)
                    == Some(character)
        })
    }

    pub fn select_character(&mut self, id: SessionId, requested: i64) -> Result<(), String> {
        let (area_id, joined) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_joined())
        };
        if !joined {
            return Ok(());
        }
        let character = if requested < 0 {
            None
        } else {
            Some(requested as usize)
        };
        if let Some(picked) = character {
            if picked >= self.characters.len() {
                return Err("That character does not exist.".to_string());
            }
            if self.character_taken(area_id, picked, id) {
                return Err("That character is already taken here.".to_string());
            }
        }
        {
            let session = self.require_session(id)?;
            if !session.may_use_character(character) {
                return Err("You are restricted to a limited set of characters.".to_string());
            }
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.character = character;
        }
        let char_arg = match character {
            Some(picked) => picked.to_string(),
            None => "-1".to_string(),
        };
        self.send(id, "PV", &[id.to_string(), "CID".to_string(), char_arg]);
        self.send_chars_check(area_id);
        Ok(())
    }

    /// Per-character availability flags for one area, pushed to every
    /// occupant.
    pub fn send_chars_check(&mut self, area_id: usize) {
        let occupants = self.area_targets(area_id);
        let mut flags = vec!["0".to_string(); self.characters.len()];
        for occupant in &occupants {
            if let Some(character) = self
                .sessions
                .get(occupant)
                .and_then(|session| session.character)
            {
                if let Some(flag) = flags.get_mut(character) {
                    *flag = "-1".to_string();
                }
            }
        }
        let frame = codec::encode_frame("CharsCheck", &flags);
        for occupant in occupants {
            self.queue_frame(occupant, frame.clone());
        }
    }

    // ---- dialogue routing --------------------------------------------------

    pub fn handle_ic_message(
        &mut self,
        id: SessionId,
        mut message: IcMessage,
        now: Instant,
    ) -> Result<(), String> {
        let (area_id, is_moderator, character, sticky_pos, ic_muted) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.is_moderator,
                session.character,
                session.sticky_pos.clone(),
                session.ic_muted,
            )
        };
        let Some(character) = character else {
            return Ok(());
        };
        if ic_muted {
            return Err("You are muted and cannot speak in dialogue.".to_string());
        }
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
            if !area.can_send_message(now) {
                return Ok(());
            }
            if let Some(locked_pos) = area.position_lock.first() {
                message.pos = locked_pos.clone();
            } else if let Some(sticky) = sticky_pos {
                message.pos = sticky;
            }
        }
        message.char_id = character as i64;
        let speaker = match message.showname.as_deref() {
            Some(showname) if !showname.is_empty() => showname.to_string(),
            _ => self.character_name(Some(character)),
        };
        let length = message.text.chars().count();
        let frame = codec::encode_frame("MS", &message.to_args());
        let overheard = format!("[pos '{}'] {}: {}", message.pos, speaker, message.text);
        for target in self.area_targets(area_id) {
            let (skip, deliver) = match self.sessions.get(&target) {
                Some(listener) => {
                    let deliver = target == id
                        || match &listener.listen_filter {
                            None => true,
                            Some(filter) => {
                                filter.matches(&message.pos, listener.sticky_pos.as_deref())
                            }
                        };
                    (listener.blinded, deliver)
                }
                None => (true, false),
            };
            if skip {
                continue;
            }
            if deliver {
                self.queue_frame(target, frame.clone());
            } else {
                self.send_host_message(target, &overheard);
            }
        }
        if let Some(area) = self.areas.get_mut(area_id) {
            area.note_message(now, length);
        }
        Ok(())
    }

    // ---- out-of-character chat ---------------------------------------------

    pub fn handle_ooc_message(
        &mut self,
        id: SessionId,
        name: &str,
        text: &str,
    ) -> Result<(), String> {
        let (area_id, ooc_muted) = {
            let session = self.require_session(id)?;
            (session.area_id, session.ooc_muted)
        };
        if ooc_muted {
            return Err("Your out-of-character chat is muted.".to_string());
        }
        if name.eq_ignore_ascii_case(&self.options.server_name) {
            return Err("That name is reserved.".to_string());
        }
        self.broadcast_area(area_id, "CT", &[name.to_string(), text.to_string()]);
        Ok(())
    }

    // ---- music and the jukebox ---------------------------------------------

    pub fn handle_music_change(
        &mut self,
        id: SessionId,
        track: &str,
        showname: &str,
        effects: i64,
        now: Instant,
    ) -> Result<(), String> {
        // An area name in the track slot is a navigation shorthand.
        if let Some(dest) = self.area_id_by_name(track) {
            return self.try_move(id, dest, now);
        }
        let (area_id, is_moderator, character, dj_blocked, last_change) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.is_moderator,
                session.character,
                session.dj_blocked,
                session.last_music_change,
            )
        };
        let Some(character) = character else {
            return Ok(());
        };
        if dj_blocked {
            return Err("You are not allowed to change music.".to_string());
        }
        let privileged = is_moderator || self.require_area(area_id)?.is_owner(id);
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        if !privileged {
            if let Some(last) = last_change {
                if now.saturating_duration_since(last) < MUSIC_CHANGE_COOLDOWN {
                    return Err("You are changing music too fast.".to_string());
                }
            }
        }
        let length = self
            .track_length(track)
            .ok_or_else(|| "That track is not on the music list.".to_string())?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_music_change = Some(now);
        }
        let jukebox_enabled = self
            .areas
            .get(area_id)
            .map(|area| area.jukebox.enabled)
            .unwrap_or(false);
        if jukebox_enabled {
            let vote = JukeboxVote {
                session: id,
                track: track.to_string(),
                length,
                showname: showname.to_string(),
                weight: 0,
            };
            let first = match self.areas.get_mut(area_id) {
                Some(area) => area.jukebox.cast_vote(vote),
                None => false,
            };
            self.send_host_message(id, "Your jukebox vote has been counted.");
            if first {
                self.jukebox_advance(area_id, now);
            }
            return Ok(());
        }
        if let Some(area) = self.areas.get_mut(area_id) {
            area.music.current_track = Some(track.to_string());
            area.music.player_character = Some(character);
            area.music.effects = effects;
            // Bit 0 of the effect mask marks a looping track.
            area.music.looping = effects & 1 != 0;
        }
        self.broadcast_area(
            area_id,
            "MC",
            &[
                track.to_string(),
                character.to_string(),
                showname.to_string(),
                effects.to_string(),
            ],
        );
        Ok(())
    }

    /// Toggles vote-driven music for the caller's area.
    pub fn toggle_jukebox(&mut self, id: SessionId, now: Instant) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        let enabled = {
            let area = self
                .areas
                .get_mut(area_id)
                .ok_or_else(|| "No such area.".to_string())?;
            area.jukebox.enabled = !area.jukebox.enabled;
            area.jukebox.enabled
        };
        if enabled {
            self.broadcast_area_host_message(area_id, "The jukebox has been turned on.");
            let has_votes = self
                .areas
                .get(area_id)
                .map(|area| area.jukebox.vote_count() > 0)
                .unwrap_or(false);
            if has_votes {
                self.jukebox_advance(area_id, now);
            }
        } else {
            if let Some(area) = self.areas.get_mut(area_id) {
                area.jukebox.clear();
            }
            self.schedule.cancel(TaskKey::JukeboxAdvance { area: area_id });
            self.broadcast_area_host_message(area_id, "The jukebox has been turned off.");
        }
        Ok(())
    }

    pub fn jukebox_skip(&mut self, id: SessionId, now: Instant) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        let enabled = self
            .require_area(area_id)?
            .jukebox
            .enabled;
        if !enabled {
            return Err("The jukebox is not running here.".to_string());
        }
        self.jukebox_advance(area_id, now);
        Ok(())
    }

    /// Picks and starts the next jukebox track, then chains the
    /// following pick after the track's declared length.
    pub fn jukebox_advance(&mut self, area_id: usize, now: Instant) {
        let winner = {
            let Some(area) = self.areas.get_mut(area_id) else {
                return;
            };
            if !area.jukebox.enabled {
                return;
            }
            Jukebox::select_next(&mut area.jukebox, &mut self.rng)
        };
        let Some(vote) = winner else {
            if let Some(area) = self.areas.get_mut(area_id) {
                area.music.current_track = None;
                area.music.player_character = None;
            }
            self.schedule.cancel(TaskKey::JukeboxAdvance { area: area_id });
            return;
        };
        let character = self
            .sessions
            .get(&vote.session)
            .and_then(|session| session.character);
        let repeat = self
            .areas
            .get(area_id)
            .map(|area| {
                area.music.current_track.as_deref() == Some(vote.track.as_str())
                    && area.music.player_character == character
            })
            .unwrap_or(false);
        if let Some(area) = self.areas.get_mut(area_id) {
            area.music.current_track = Some(vote.track.clone());
            area.music.player_character = character;
        }
        if !repeat {
            let char_arg = character
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-1".to_string());
            self.broadcast_area(
                area_id,
                "MC",
                &[vote.track.clone(), char_arg, vote.showname.clone()],
            );
        }
        let key = TaskKey::JukeboxAdvance { area: area_id };
        if vote.length > 0 {
            self.schedule
                .schedule(key, Duration::from_secs(vote.length as u64), now);
        } else {
            self.schedule.cancel(key);
        }
    }

    // ---- judge controls ----------------------------------------------------

    pub fn handle_judge_signal(
        &mut self,
        id: SessionId,
        kind: &str,
        variant: Option<i64>,
    ) -> Result<(), String> {
        let (area_id, is_moderator, character, blocked) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.is_moderator,
                session.character,
                session.wtce_blocked,
            )
        };
        let Some(character) = character else {
            return Ok(());
        };
        if blocked {
            return Err("You cannot use judge signals.".to_string());
        }
        if kind != "testimony1" && kind != "testimony2" {
            return Ok(());
        }
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        let mut args = vec![kind.to_string()];
        if let Some(variant) = variant {
            args.push(variant.to_string());
        }
        self.broadcast_area(area_id, "RT", &args);
        let name = self.character_name(Some(character));
        let signal = if kind == "testimony1" {
            "witness testimony"
        } else {
            "cross examination"
        };
        if let Some(area) = self.areas.get_mut(area_id) {
            area.push_judge_log(format!("{} signalled {}", name, signal));
        }
        Ok(())
    }

    pub fn handle_penalty(&mut self, id: SessionId, side: i64, value: i64) -> Result<(), String> {
        let (area_id, is_moderator, character) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator, session.character)
        };
        let Some(character) = character else {
            return Ok(());
        };
        if !(1..=2).contains(&side) || !(0..=PENALTY_MAX).contains(&value) {
            return Err("Invalid penalty value.".to_string());
        }
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        if let Some(area) = self.areas.get_mut(area_id) {
            if side == 1 {
                area.def_penalty = value;
            } else {
                area.pro_penalty = value;
            }
        }
        self.broadcast_area(area_id, "HP", &[side.to_string(), value.to_string()]);
        let name = self.character_name(Some(character));
        let bar = if side == 1 { "defense" } else { "prosecution" };
        if let Some(area) = self.areas.get_mut(area_id) {
            area.push_judge_log(format!("{} set the {} bar to {}", name, bar, value));
        }
        Ok(())
    }

    // ---- evidence ----------------------------------------------------------

    pub fn evidence_add(
        &mut self,
        id: SessionId,
        name: &str,
        description: &str,
        image: &str,
    ) -> Result<(), String> {
        let (area_id, is_moderator) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator)
        };
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        if let Some(area) = self.areas.get_mut(area_id) {
            area.evidence.push(Evidence::new(
                name.to_string(),
                description.to_string(),
                image.to_string(),
            ));
        }
        self.send_evidence_list(area_id);
        Ok(())
    }

    pub fn evidence_delete(&mut self, id: SessionId, index: i64) -> Result<(), String> {
        let (area_id, is_moderator) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator)
        };
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        let area = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?;
        if index < 0 || index as usize >= area.evidence.len() {
            return Err("No such evidence.".to_string());
        }
        area.evidence.remove(index as usize);
        self.send_evidence_list(area_id);
        Ok(())
    }

    pub fn evidence_edit(
        &mut self,
        id: SessionId,
        index: i64,
        name: &str,
        description: &str,
        image: &str,
    ) -> Result<(), String> {
        let (area_id, is_moderator) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator)
        };
        {
            let area = self.require_area(area_id)?;
            if area.cannot_interact(id, is_moderator) {
                return Err(
                    "This area is spectate-only; ask a steward for an invite.".to_string()
                );
            }
        }
        let area = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?;
        let slot = area
            .evidence
            .get_mut(index.max(0) as usize)
            .filter(|_| index >= 0)
            .ok_or_else(|| "No such evidence.".to_string())?;
        slot.name = name.to_string();
        slot.description = description.to_string();
        slot.image = image.to_string();
        self.send_evidence_list(area_id);
        Ok(())
    }

    /// Pushes the evidence list to every occupant, applying each
    /// listener's visibility.
    pub fn send_evidence_list(&mut self, area_id: usize) {
        for target in self.area_targets(area_id) {
            self.send_evidence_list_to(target);
        }
    }

    fn send_evidence_list_to(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let area_id = session.area_id;
        let position = session.sticky_pos.clone();
        let is_moderator = session.is_moderator;
        let Some(area) = self.areas.get(area_id) else {
            return;
        };
        let privileged = is_moderator || area.is_owner(id);
        let args: Vec<String> = area
            .evidence
            .iter()
            .filter(|item| item.visible_from(position.as_deref(), privileged))
            .map(|item| item.to_wire())
            .collect();
        self.send(id, "LE", &args);
    }

    // ---- moderator calls ---------------------------------------------------

    pub fn handle_mod_call(
        &mut self,
        id: SessionId,
        reason: &str,
        now: Instant,
    ) -> Result<(), String> {
        let (area_id, character, ipid, last_call) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.character,
                session.ipid.clone(),
                session.last_mod_call,
            )
        };
        if let Some(last) = last_call {
            if now.saturating_duration_since(last) < MOD_CALL_COOLDOWN {
                return Err(
                    "You must wait before calling a moderator again.".to_string()
                );
            }
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_mod_call = Some(now);
        }
        let area_name = self.require_area(area_id)?.name.clone();
        let who = self.character_name(character);
        let info = if reason.is_empty() {
            format!("{} ({}) called for a moderator in {}", who, ipid, area_name)
        } else {
            format!(
                "{} ({}) called for a moderator in {}: {}",
                who, ipid, area_name, reason
            )
        };
        logging::log_mod(&info);
        let moderators: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_joined() && session.is_moderator)
            .map(|session| session.id)
            .collect();
        let frame = codec::encode_frame("ZZ", &[info]);
        for target in moderators {
            self.queue_frame(target, frame.clone());
        }
        self.send_host_message(id, "The moderators have been informed.");
        Ok(())
    }

    // ---- movement ----------------------------------------------------------

    pub fn try_move(&mut self, id: SessionId, dest_id: usize, now: Instant) -> Result<(), String> {
        let (origin_id, is_moderator, character, personal_delay, last_move) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.is_moderator,
                session.character,
                session.move_delay_seconds,
                session.last_move,
            )
        };
        if dest_id == origin_id {
            return Err("You are already there.".to_string());
        }
        if dest_id >= self.areas.len() {
            return Err("No such area.".to_string());
        }
        let target_position = {
            let origin = self.require_area(origin_id)?;
            if !is_moderator && !origin.links.is_empty() {
                let link = origin
                    .links
                    .get(&dest_id)
                    .filter(|link| !link.hidden)
                    .ok_or_else(|| "No passage leads there.".to_string())?;
                if link.locked {
                    return Err("The passage there is locked.".to_string());
                }
                if !origin.satisfies_evidence_gate(&link.evidence_gate) {
                    return Err("You lack something required for that passage.".to_string());
                }
            }
            origin
                .links
                .get(&dest_id)
                .map(|link| link.target_position.clone())
                .filter(|pos| !pos.is_empty())
        };
        if !is_moderator {
            let wait = Duration::from_secs(
                personal_delay
                    + self.require_area(origin_id)?.move_delay_seconds
                    + self.options.move_delay_seconds,
            );
            if let Some(last) = last_move {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < wait {
                    let remaining = (wait - elapsed).as_secs().max(1);
                    return Err(format!(
                        "You must wait {} more seconds before moving again.",
                        remaining
                    ));
                }
            }
        }
        self.require_area(dest_id)?.may_enter(id, is_moderator)?;

        if let Some(area) = self.areas.get_mut(origin_id) {
            area.remove_occupant(id);
        }
        if let Some(area) = self.areas.get_mut(dest_id) {
            area.add_occupant(id);
        }
        let mut lost_character = false;
        if let Some(picked) = character {
            if self.character_taken(dest_id, picked, id) {
                lost_character = true;
            }
        }
        let dest_name = self.require_area(dest_id)?.name.clone();
        let background = self.require_area(dest_id)?.background.clone();
        if let Some(session) = self.sessions.get_mut(&id) {
            session.area_id = dest_id;
            session.last_move = Some(now);
            if lost_character {
                session.character = None;
            }
            if let Some(position) = target_position {
                session.sticky_pos = Some(position);
            }
        }
        if lost_character {
            self.send(id, "PV", &[id.to_string(), "CID".to_string(), "-1".to_string()]);
            self.send_host_message(
                id,
                "Your character is taken in this area; you are now a spectator.",
            );
        }
        self.send(id, "BN", &[background]);
        self.send_evidence_list_to(id);
        self.send_host_message(id, &format!("Moved to {}.", dest_name));
        self.send_chars_check(origin_id);
        self.send_chars_check(dest_id);
        self.arup_players();
        Ok(())
    }

    pub fn peek(&mut self, id: SessionId, dest_id: usize) -> Result<(), String> {
        let (origin_id, is_moderator) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator)
        };
        {
            let origin = self.require_area(origin_id)?;
            if !is_moderator && !origin.links.is_empty() {
                let link = origin
                    .links
                    .get(&dest_id)
                    .filter(|link| !link.hidden)
                    .ok_or_else(|| "No passage leads there.".to_string())?;
                if !link.can_peek {
                    return Err("You cannot peek through that passage.".to_string());
                }
            }
        }
        let dest = self.require_area(dest_id)?;
        let text = format!(
            "{} currently holds {} player(s).",
            dest.name,
            dest.occupant_count()
        );
        self.send_host_message(id, &text);
        Ok(())
    }

    // ---- locks, invites and stewardship ------------------------------------

    pub fn lock_area(&mut self, id: SessionId, lock: LockState) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        {
            let area = self.require_area(area_id)?;
            if area.lock == lock {
                return Err(format!("This area is already {}.", lock.label()));
            }
        }
        let occupants = self.area_targets(area_id);
        if let Some(area) = self.areas.get_mut(area_id) {
            area.set_lock(lock);
            if lock != LockState::Free {
                // Occupants present at lock time keep their standing.
                for occupant in occupants {
                    area.invite_list.insert(occupant);
                }
            }
        }
        let notice = match lock {
            LockState::Free => "This area is now unlocked.",
            LockState::Spectatable => "This area is now spectate-only.",
            LockState::Locked => "This area is now locked.",
        };
        self.broadcast_area_host_message(area_id, notice);
        self.arup_statuses();
        self.arup_locks();
        Ok(())
    }

    pub fn invite(&mut self, id: SessionId, target: SessionId) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        if self.sessions.get(&target).is_none() {
            return Err("No such client id.".to_string());
        }
        let inserted = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .invite_list
            .insert(target);
        if !inserted {
            return Err("They are already invited.".to_string());
        }
        self.send_host_message(target, "You have been invited to speak in the area.");
        self.send_host_message(id, "Invite sent.");
        Ok(())
    }

    pub fn uninvite(&mut self, id: SessionId, target: SessionId) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        let removed = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .invite_list
            .remove(&target);
        if !removed {
            return Err("They are not on the invite list.".to_string());
        }
        self.send_host_message(id, "Invite revoked.");
        Ok(())
    }

    pub fn claim_stewardship(
        &mut self,
        id: SessionId,
        target: Option<SessionId>,
    ) -> Result<(), String> {
        let (area_id, is_moderator, has_character) = {
            let session = self.require_session(id)?;
            (
                session.area_id,
                session.is_moderator,
                session.has_character(),
            )
        };
        let subject = target.unwrap_or(id);
        if target.is_some() {
            // Adding someone else requires standing of your own.
            let area = self.require_area(area_id)?;
            if !is_moderator && !area.is_owner(id) {
                return Err("Only a steward or moderator may add stewards.".to_string());
            }
            if self.sessions.get(&subject).is_none() {
                return Err("No such client id.".to_string());
            }
        } else {
            if !has_character {
                return Err("Spectators cannot claim an area.".to_string());
            }
            let area = self.require_area(area_id)?;
            if !area.owners.is_empty() && !area.is_owner(id) && !is_moderator {
                return Err("This area already has a steward.".to_string());
            }
        }
        let inserted = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .owners
            .insert(subject);
        if !inserted {
            return Err("They are already a steward here.".to_string());
        }
        let name = self
            .sessions
            .get(&subject)
            .map(|session| self.character_name(session.character))
            .unwrap_or_default();
        self.broadcast_area_host_message(area_id, &format!("{} is now a steward here.", name));
        self.arup_stewards();
        Ok(())
    }

    pub fn drop_stewardship(
        &mut self,
        id: SessionId,
        target: Option<SessionId>,
    ) -> Result<(), String> {
        let (area_id, is_moderator) = {
            let session = self.require_session(id)?;
            (session.area_id, session.is_moderator)
        };
        let subject = target.unwrap_or(id);
        if subject != id && !is_moderator {
            let area = self.require_area(area_id)?;
            if !area.is_owner(id) {
                return Err("Only a steward or moderator may remove stewards.".to_string());
            }
        }
        let removed = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .owners
            .remove(&subject);
        if !removed {
            return Err("They are not a steward here.".to_string());
        }
        self.arup_stewards();
        Ok(())
    }

    pub fn set_background(&mut self, id: SessionId, background: &str) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        self.areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .background = background.to_string();
        self.broadcast_area(area_id, "BN", &[background.to_string()]);
        Ok(())
    }

    pub fn set_position_lock(
        &mut self,
        id: SessionId,
        positions: Vec<String>,
    ) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        let notice = if positions.is_empty() {
            "The position lock has been cleared.".to_string()
        } else {
            format!("Positions locked to: {}.", positions.join(", "))
        };
        self.areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .position_lock = positions;
        self.broadcast_area_host_message(area_id, &notice);
        Ok(())
    }

    // ---- link management ---------------------------------------------------

    pub fn link_areas(&mut self, id: SessionId, dest_id: usize) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        if dest_id >= self.areas.len() {
            return Err("No such area.".to_string());
        }
        if dest_id == area_id {
            return Err("An area cannot link to itself.".to_string());
        }
        // Two independent one-way records; later flag changes apply
        // per direction.
        if let Some(area) = self.areas.get_mut(area_id) {
            area.links.entry(dest_id).or_default();
        }
        if let Some(area) = self.areas.get_mut(dest_id) {
            area.links.entry(area_id).or_default();
        }
        let dest_name = self.require_area(dest_id)?.name.clone();
        self.send_host_message(id, &format!("Linked this area with {}.", dest_name));
        Ok(())
    }

    pub fn unlink_areas(&mut self, id: SessionId, dest_id: usize) -> Result<(), String> {
        let area_id = self.require_session(id)?.area_id;
        let removed = self
            .areas
            .get_mut(area_id)
            .map(|area| area.links.remove(&dest_id).is_some())
            .unwrap_or(false);
        if let Some(area) = self.areas.get_mut(dest_id) {
            area.links.remove(&area_id);
        }
        if !removed {
            return Err("There is no link there.".to_string());
        }
        self.send_host_message(id, "Link removed.");
        Ok(())
    }

    pub fn edit_link<F>(&mut self, id: SessionId, dest_id: usize, edit: F) -> Result<(), String>
    where
        F: FnOnce(&mut AreaLink),
    {
        let area_id = self.require_session(id)?.area_id;
        let link = self
            .areas
            .get_mut(area_id)
            .ok_or_else(|| "No such area.".to_string())?
            .links
            .get_mut(&dest_id)
            .ok_or_else(|| "There is no link there.".to_string())?;
        edit(link);
        self.send_host_message(id, "Link updated.");
        Ok(())
    }

    // ---- timers ------------------------------------------------------------

    fn timer_scope(&self, id: SessionId, timer_id: usize) -> Result<TimerScope, String> {
        match timer_id {
            0 => {
                let session = self.require_session(id)?;
                if !session.is_moderator {
                    return Err("Only moderators may touch the global timer.".to_string());
                }
                Ok(TimerScope::Global)
            }
            1..=4 => Ok(TimerScope::Area {
                area: self.require_session(id)?.area_id,
                slot: timer_id - 1,
            }),
            _ => Err("Timer ids run from 0 to 4.".to_string()),
        }
    }

    fn timer_mut(&mut self, scope: TimerScope) -> Result<&mut CourtTimer, String> {
        match scope {
            TimerScope::Global => Ok(&mut self.global_timer),
            TimerScope::Area { area, slot } => self
                .areas
                .get_mut(area)
                .and_then(|area| area.timers.get_mut(slot))
                .ok_or_else(|| "No such timer.".to_string()),
        }
    }

    fn timer_key(scope: TimerScope) -> TaskKey {
        match scope {
            TimerScope::Global => TaskKey::GlobalTimer,
            TimerScope::Area { area, slot } => TaskKey::AreaTimer { area, slot },
        }
    }

    pub fn timer_status(&mut self, id: SessionId, timer_id: usize, now: Instant) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        let timer = *self.timer_mut(scope)?;
        let text = if !timer.is_set() {
            format!("Timer {} is not set.", timer_id)
        } else if timer.is_running() {
            format!(
                "Timer {} is running with {}s left.",
                timer_id,
                timer.remaining(now).as_secs()
            )
        } else {
            format!(
                "Timer {} is paused at {}s.",
                timer_id,
                timer.remaining(now).as_secs()
            )
        };
        self.send_host_message(id, &text);
        Ok(())
    }

    pub fn timer_set(
        &mut self,
        id: SessionId,
        timer_id: usize,
        value: Duration,
        now: Instant,
    ) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        let running = {
            let timer = self.timer_mut(scope)?;
            timer.set(value, now);
            timer.is_running()
        };
        self.sync_timer_schedule(scope, now);
        let ms = value.as_millis().to_string();
        let kind = if running { "0" } else { "1" };
        self.broadcast_scope(
            scope,
            "TI",
            &[timer_id.to_string(), "2".to_string(), "0".to_string()],
        );
        self.broadcast_scope(scope, "TI", &[timer_id.to_string(), kind.to_string(), ms]);
        Ok(())
    }

    pub fn timer_adjust(
        &mut self,
        id: SessionId,
        timer_id: usize,
        delta: Duration,
        add: bool,
        now: Instant,
    ) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        {
            let timer = self.timer_mut(scope)?;
            if !timer.is_set() {
                return Err("That timer is not set.".to_string());
            }
            timer.adjust(delta, add, now);
        }
        self.sync_timer_schedule(scope, now);
        let (running, remaining) = {
            let timer = self.timer_mut(scope)?;
            (timer.is_running(), timer.remaining(now))
        };
        let kind = if running { "0" } else { "1" };
        self.broadcast_scope(
            scope,
            "TI",
            &[
                timer_id.to_string(),
                kind.to_string(),
                remaining.as_millis().to_string(),
            ],
        );
        Ok(())
    }

    pub fn timer_start(&mut self, id: SessionId, timer_id: usize, now: Instant) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        let started = {
            let timer = self.timer_mut(scope)?;
            timer.start(now)
        };
        if !started {
            return Err("That timer is not ready to start.".to_string());
        }
        self.sync_timer_schedule(scope, now);
        let remaining = self.timer_mut(scope)?.remaining(now);
        self.broadcast_scope(
            scope,
            "TI",
            &[
                timer_id.to_string(),
                "0".to_string(),
                remaining.as_millis().to_string(),
            ],
        );
        Ok(())
    }

    pub fn timer_pause(&mut self, id: SessionId, timer_id: usize, now: Instant) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        let paused = {
            let timer = self.timer_mut(scope)?;
            timer.pause(now)
        };
        if !paused {
            return Err("That timer is not running.".to_string());
        }
        self.sync_timer_schedule(scope, now);
        let remaining = self.timer_mut(scope)?.remaining(now);
        self.broadcast_scope(
            scope,
            "TI",
            &[
                timer_id.to_string(),
                "1".to_string(),
                remaining.as_millis().to_string(),
            ],
        );
        Ok(())
    }

    pub fn timer_unset(&mut self, id: SessionId, timer_id: usize, now: Instant) -> Result<(), String> {
        let scope = self.timer_scope(id, timer_id)?;
        {
            let timer = self.timer_mut(scope)?;
            timer.unset();
        }
        self.sync_timer_schedule(scope, now);
        self.broadcast_scope(
            scope,
            "TI",
            &[timer_id.to_string(), "3".to_string(), "0".to_string()],
        );
        Ok(())
    }

    /// Keeps the deferred queue consistent with the timer: at most one
    /// pending expiry exists, and only while the timer runs.
    fn sync_timer_schedule(&mut self, scope: TimerScope, now: Instant) {
        let key = Self::timer_key(scope);
        let deadline = {
            match self.timer_mut(scope) {
                Ok(timer) if timer.is_running() => Some(timer.remaining(now)),
                _ => None,
            }
        };
        match deadline {
            Some(remaining) => self.schedule.schedule(key, remaining, now),
            None => {
                self.schedule.cancel(key);
            }
        }
    }

    fn expire_timer(&mut self, scope: TimerScope) {
        if let Ok(timer) = self.timer_mut(scope) {
            timer.expire();
        }
        let timer_id = scope.client_id();
        self.broadcast_scope(
            scope,
            "TI",
            &[timer_id.to_string(), "1".to_string(), "0".to_string()],
        );
        let notice = format!("Timer {} has expired.", timer_id);
        match scope {
            TimerScope::Global => {
                let name = self.options.server_name.clone();
                self.broadcast_joined("CT", &[name, notice]);
            }
            TimerScope::Area { area, .. } => {
                self.broadcast_area_host_message(area, &notice);
            }
        }
    }

    /// Runs every deferred action whose deadline has passed. Called
    /// from the background tick thread.
    pub fn run_due_tasks(&mut self, now: Instant) {
        while let Some(key) = self.schedule.pop_due(now) {
            match key {
                TaskKey::GlobalTimer => self.expire_timer(TimerScope::Global),
                TaskKey::AreaTimer { area, slot } => {
                    self.expire_timer(TimerScope::Area { area, slot })
                }
                TaskKey::JukeboxAdvance { area } => self.jukebox_advance(area, now),
            }
        }
    }

    // ---- moderation --------------------------------------------------------

    pub fn login_moderator(&mut self, id: SessionId, password: &str) -> Result<(), String> {
        let ipid = self.require_session(id)?.ipid.clone();
        let expected = self
            .options
            .mod_password
            .clone()
            .ok_or_else(|| "Moderator login is disabled.".to_string())?;
        if password != expected {
            logging::log_mod(&format!("failed moderator login from {} ({})", id, ipid));
            return Err("Wrong password.".to_string());
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.is_moderator = true;
        }
        logging::log_mod(&format!("session {} ({}) logged in as moderator", id, ipid));
        self.send_host_message(id, "Logged in as a moderator.");
        Ok(())
    }

    pub fn set_mod_flag(
        &mut self,
        target: SessionId,
        flag: ModFlag,
        value: bool,
    ) -> Result<(), String> {
        let session = self
            .sessions
            .get_mut(&target)
            .ok_or_else(|| "No such client id.".to_string())?;
        match flag {
            ModFlag::IcMute => session.ic_muted = value,
            ModFlag::OocMute => session.ooc_muted = value,
            ModFlag::JudgeControls => session.wtce_blocked = value,
            ModFlag::Dj => session.dj_blocked = value,
            ModFlag::Blind => session.blinded = value,
        }
        self.send_host_message(target, flag.describe(value));
        Ok(())
    }

    pub fn set_charcurse(
        &mut self,
        target: SessionId,
        allowed: Vec<usize>,
    ) -> Result<(), String> {
        let roster_len = self.characters.len();
        if allowed.iter().any(|&id| id >= roster_len) {
            return Err("A character id in the list does not exist.".to_string());
        }
        let (current, area_id) = {
            let session = self
                .sessions
                .get_mut(&target)
                .ok_or_else(|| "No such client id.".to_string())?;
            session.charcurse = allowed;
            (session.character, session.area_id)
        };
        // A curse takes effect immediately if the current character is
        // now off-list.
        let still_allowed = self
            .sessions
            .get(&target)
            .map(|session| session.may_use_character(current))
            .unwrap_or(true);
        if !still_allowed {
            if let Some(session) = self.sessions.get_mut(&target) {
                session.character = None;
            }
            self.send(
                target,
                "PV",
                &[target.to_string(), "CID".to_string(), "-1".to_string()],
            );
            self.send_chars_check(area_id);
        }
        self.send_host_message(target, "A moderator has restricted your character choices.");
        Ok(())
    }

    pub fn clear_charcurse(&mut self, target: SessionId) -> Result<(), String> {
        let session = self
            .sessions
            .get_mut(&target)
            .ok_or_else(|| "No such client id.".to_string())?;
        session.charcurse.clear();
        self.send_host_message(target, "Your character restrictions have been lifted.");
        Ok(())
    }

    pub fn kick(&mut self, actor: SessionId, target: SessionId, reason: &str) -> Result<(), String> {
        let (ipid, hdid) = {
            let session = self
                .sessions
                .get(&target)
                .ok_or_else(|| "No such client id.".to_string())?;
            (session.ipid.clone(), session.hdid.clone())
        };
        let reason = if reason.is_empty() { "No reason given." } else { reason };
        logging::log_mod(&format!(
            "session {} kicked {} ({} / {}): {}",
            actor, target, ipid, hdid, reason
        ));
        self.send(target, "KK", &[reason.to_string()]);
        if let Some(session) = self.sessions.get_mut(&target) {
            session.close_after_flush = true;
        }
        self.send_host_message(actor, "Kicked.");
        Ok(())
    }

    pub fn ban(&mut self, actor: SessionId, target: SessionId, reason: &str) -> Result<(), String> {
        let (ipid, hdid) = {
            let session = self
                .sessions
                .get(&target)
                .ok_or_else(|| "No such client id.".to_string())?;
            (session.ipid.clone(), session.hdid.clone())
        };
        let reason = if reason.is_empty() { "No reason given." } else { reason };
        self.banlist.add(BanRecord {
            ipid: Some(ipid.clone()),
            hdid: if hdid.is_empty() { None } else { Some(hdid.clone()) },
            reason: reason.to_string(),
        });
        self.persist_banlist();
        logging::log_mod(&format!(
            "session {} banned {} ({} / {}): {}",
            actor, target, ipid, hdid, reason
        ));
        self.send(target, "BD", &[reason.to_string()]);
        if let Some(session) = self.sessions.get_mut(&target) {
            session.close_after_flush = true;
        }
        self.send_host_message(actor, "Banned.");
        Ok(())
    }

    pub fn unban(&mut self, token: &str) -> Result<(), String> {
        if self.banlist.remove(token) {
            self.persist_banlist();
            Ok(())
        } else {
            Err("No ban matches that id.".to_string())
        }
    }

    pub fn announce(&mut self, text: &str) {
        let name = self.options.server_name.clone();
        let body = format!("=== Announcement ===\r\n{}", text);
        self.broadcast_joined("CT", &[name, body]);
    }

    pub fn case_announcement(
        &mut self,
        id: SessionId,
        text: &str,
        now: Instant,
    ) -> Result<(), String> {
        let (area_id, character, last) = {
            let session = self.require_session(id)?;
            (session.area_id, session.character, session.last_case_announce)
        };
        if let Some(last) = last {
            if now.saturating_duration_since(last) < CASE_ANNOUNCE_COOLDOWN {
                return Err("You must wait before announcing another case.".to_string());
            }
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_case_announce = Some(now);
        }
        let who = self.character_name(character);
        let area_name = self.require_area(area_id)?.name.clone();
        let name = self.options.server_name.clone();
        let body = format!("=== Case === {} in {} needs players: {}", who, area_name, text);
        self.broadcast_joined("CT", &[name, body]);
        Ok(())
    }

    pub fn send_motd(&mut self, id: SessionId) {
        let motd = self.options.motd.clone();
        let text = if motd.is_empty() {
            "No message of the day has been set.".to_string()
        } else {
            motd
        };
        self.send_host_message(id, &text);
    }

    // ---- info builders -----------------------------------------------------

    pub fn area_roll_call(&self, area_id: usize) -> Result<String, String> {
        let area = self.require_area(area_id)?;
        let mut lines = vec![format!(
            "=== {} ({} player(s), {}) ===",
            area.name,
            area.occupant_count(),
            area.lock.label()
        )];
        for occupant in area.occupants() {
            if let Some(session) = self.sessions.get(occupant) {
                let mut line = format!("[{}] {}", occupant, self.character_name(session.character));
                if area.is_owner(*occupant) {
                    line.push_str(" (steward)");
                }
                lines.push(line);
            }
        }
        Ok(lines.join("\r\n"))
    }

    pub fn full_roll_call(&self) -> String {
        let mut sections = Vec::with_capacity(self.areas.len());
        for area in &self.areas {
            if let Ok(section) = self.area_roll_call(area.id) {
                sections.push(section);
            }
        }
        sections.join("\r\n")
    }

    pub fn area_listing(&self) -> String {
        let mut lines = Vec::with_capacity(self.areas.len());
        for area in &self.areas {
            lines.push(format!(
                "[{}] {} ({} player(s), {})",
                area.id,
                area.name,
                area.occupant_count(),
                area.lock.label()
            ));
        }
        lines.join("\r\n")
    }
}

/// Shared fixture for unit tests across the crate: three areas, four
/// characters, two listed tracks, moderator password "hunter2".
#[cfg(test)]
pub(crate) fn sample_hub() -> HubState {
    use crate::persistence::store::{
        AreaEntry, MusicCategoryEntry, ServerData, ServerSettings, TrackEntry,
    };
    let data = ServerData {
        settings: ServerSettings {
            server_name: "oyez".to_string(),
            motd: "welcome".to_string(),
            max_players: 16,
            mod_password: Some("hunter2".to_string()),
            move_delay_seconds: 0,
        },
        areas: vec![
            AreaEntry::named("Lobby"),
            AreaEntry::named("Courtroom 1"),
            AreaEntry::named("Courtroom 2"),
        ],
        characters: vec![
            "Phoenix".to_string(),
            "Edgeworth".to_string(),
            "Maya".to_string(),
            "Gumshoe".to_string(),
        ],
        music: vec![MusicCategoryEntry {
            category: "== Trial ==".to_string(),
            songs: vec![
                TrackEntry {
                    name: "objection.mp3".to_string(),
                    length: 90,
                },
                TrackEntry {
                    name: "pursuit.mp3".to_string(),
                    length: 120,
                },
            ],
        }],
    };
    HubState::new(data, BanList::empty()).with_rng_seed(0xabcd)
}
