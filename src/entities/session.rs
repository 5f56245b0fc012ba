use std::net::IpAddr;
use std::time::Instant;

/// Server-assigned connection id, monotonic for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of one connection. Character selection is re-entrant, so
/// "has a character" is tracked separately via [`Session::character`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStage {
    /// Waiting for the hardware-id handshake.
    Handshaking,
    /// Handshake accepted, still fetching rosters.
    Joining,
    /// Fully joined; occupies an area.
    Joined,
}

/// What a listener wants to overhear. Messages outside the filter are
/// delivered as a rewritten host line instead of true dialogue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenFilter {
    /// Only the listener's own position.
    OwnPosition,
    /// An explicit set of position names.
    Positions(Vec<String>),
}

impl ListenFilter {
    pub fn matches(&self, message_pos: &str, own_pos: Option<&str>) -> bool {
        match self {
            ListenFilter::OwnPosition => own_pos == Some(message_pos),
            ListenFilter::Positions(allowed) => {
                allowed.iter().any(|pos| pos == message_pos)
            }
        }
    }
}

/// Per-connection state. The session owns its character selection and
/// moderation flags; the area it stands in is referenced by id only.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub ipid: String,
    pub hdid: String,
    pub stage: SessionStage,
    pub software: String,
    pub software_version: String,

    /// Index into the character roster; `None` is a spectator.
    pub character: Option<usize>,
    pub area_id: usize,
    /// Sticky position, set via /pos, overriding the claimed position
    /// of outgoing dialogue while no area position lock applies.
    pub sticky_pos: Option<String>,
    pub listen_filter: Option<ListenFilter>,

    pub is_moderator: bool,
    pub ic_muted: bool,
    pub ooc_muted: bool,
    pub wtce_blocked: bool,
    pub dj_blocked: bool,
    pub blinded: bool,
    /// Allow-list of character ids a moderator has restricted this
    /// session to; empty means unrestricted.
    pub charcurse: Vec<usize>,

    pub last_mod_call: Option<Instant>,
    pub last_music_change: Option<Instant>,
    pub last_move: Option<Instant>,
    pub last_case_announce: Option<Instant>,
    /// Personal contribution to the inter-area movement cooldown.
    pub move_delay_seconds: u64,

    /// Frames queued for this connection, drained by its transport
    /// thread.
    pub outbox: Vec<String>,
    /// Set by kicks and bans: flush the outbox, then drop the link.
    pub close_after_flush: bool,
}

impl Session {
    pub fn new(id: SessionId, ip: IpAddr) -> Self {
        Self {
            id,
            ipid: ip.to_string(),
            hdid: String::new(),
            stage: SessionStage::Handshaking,
            software: String::new(),
            software_version: String::new(),
            character: None,
            area_id: 0,
            sticky_pos: None,
            listen_filter: None,
            is_moderator: false,
            ic_muted: false,
            ooc_muted: false,
            wtce_blocked: false,
            dj_blocked: false,
            blinded: false,
            charcurse: Vec::new(),
            last_mod_call: None,
            last_music_change: None,
            last_move: None,
            last_case_announce: None,
            move_delay_seconds: 0,
            outbox: Vec::new(),
            close_after_flush: false,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.stage == SessionStage::Joined
    }

    pub fn has_character(&self) -> bool {
        self.character.is_some()
    }

    /// Charcurse check: an empty list is no restriction; returning to
    /// spectator is always allowed.
    pub fn may_use_character(&self, character: Option<usize>) -> bool {
        match character {
            None => true,
            Some(id) => self.charcurse.is_empty() || self.charcurse.contains(&id),
        }
    }

    pub fn queue_frame(&mut self, frame: String) {
        self.outbox.push(frame);
    }
}
