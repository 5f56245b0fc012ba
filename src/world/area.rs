use crate::entities::evidence::Evidence;
use crate::entities::session::SessionId;
use crate::world::jukebox::Jukebox;
use crate::world::timer::CourtTimer;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

pub const JUDGE_LOG_CAPACITY: usize = 10;
pub const AREA_TIMER_SLOTS: usize = 4;
pub const PENALTY_MAX: i64 = 10;

const PACING_BASE_MS: u64 = 100;
const PACING_PER_CHAR_MS: u64 = 60;
const PACING_CEILING_MS: u64 = 3000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Free,
    Spectatable,
    Locked,
}

impl LockState {
    pub fn label(&self) -> &'static str {
        match self {
            LockState::Free => "FREE",
            LockState::Spectatable => "SPECTATABLE",
            LockState::Locked => "LOCKED",
        }
    }
}

/// One-way passage to another area. The reverse direction, if any, is
/// a separate record owned by the target area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AreaLink {
    pub locked: bool,
    pub hidden: bool,
    /// Position travellers are placed at on arrival; empty keeps their
    /// sticky position.
    pub target_position: String,
    pub can_peek: bool,
    /// Evidence indices that must exist in the origin area before
    /// non-privileged sessions may pass.
    pub evidence_gate: Vec<usize>,
}

impl Default for AreaLink {
    fn default() -> Self {
        Self {
            locked: false,
            hidden: false,
            target_position: String::new(),
            can_peek: true,
            evidence_gate: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MusicState {
    pub current_track: Option<String>,
    pub player_character: Option<usize>,
    pub looping: bool,
    pub effects: i64,
}

/// A room: the unit of occupancy, locking and message scoping.
#[derive(Debug)]
pub struct Area {
    pub id: usize,
    pub name: String,
    pub abbreviation: String,
    pub background: String,

    occupants: Vec<SessionId>,
    pub lock: LockState,
    pub invite_list: HashSet<SessionId>,
    pub owners: HashSet<SessionId>,
    pub position_lock: Vec<String>,
    pub links: HashMap<usize, AreaLink>,

    pub evidence: Vec<Evidence>,
    pub music: MusicState,
    pub jukebox: Jukebox,
    judge_log: VecDeque<String>,

    next_message_at: Option<Instant>,
    pub move_delay_seconds: u64,
    /// 0 closes the area entirely, -1 lifts the cap.
    pub max_players: i64,
    pub def_penalty: i64,
    pub pro_penalty: i64,
    pub timers: [CourtTimer; AREA_TIMER_SLOTS],
}

impl Area {
    pub fn new(id: usize, name: &str, background: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            abbreviation: derive_abbreviation(name),
            background: background.to_string(),
            occupants: Vec::new(),
            lock: LockState::Free,
            invite_list: HashSet::new(),
            owners: HashSet::new(),
            position_lock: Vec::new(),
            links: HashMap::new(),
            evidence: Vec::new(),
            music: MusicState::default(),
            jukebox: Jukebox::new(),
            judge_log: VecDeque::with_capacity(JUDGE_LOG_CAPACITY),
            next_message_at: None,
            move_delay_seconds: 0,
            max_players: -1,
            def_penalty: PENALTY_MAX,
            pro_penalty: PENALTY_MAX,
            timers: [CourtTimer::new(); AREA_TIMER_SLOTS],
        }
    }

    pub fn occupants(&self) -> &[SessionId] {
        &self.occupants
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.occupants.contains(&id)
    }

    pub fn add_occupant(&mut self, id: SessionId) {
        if !self.occupants.contains(&id) {
            self.occupants.push(id);
        }
    }

    pub fn remove_occupant(&mut self, id: SessionId) {
        self.occupants.retain(|occupant| *occupant != id);
    }

    pub fn is_owner(&self, id: SessionId) -> bool {
        self.owners.contains(&id)
    }

    pub fn is_invited(&self, id: SessionId) -> bool {
        self.invite_list.contains(&id)
    }

    /// Spectate-only gate: blocks dialogue, penalty changes and judge
    /// signals for uninvited, unprivileged sessions while the area is
    /// SPECTATABLE. A full lock restricts entry, not interaction.
    pub fn cannot_interact(&self, id: SessionId, is_moderator: bool) -> bool {
        self.lock == LockState::Spectatable
            && !is_moderator
            && !self.is_invited(id)
            && !self.is_owner(id)
    }

    /// Entry gate for new, non-privileged occupants. Privileged means
    /// moderator or steward of this area; the invite list also passes.
    pub fn may_enter(&self, id: SessionId, is_moderator: bool) -> Result<(), String> {
        let privileged = is_moderator || self.is_owner(id) || self.is_invited(id);
        match self.lock {
            LockState::Free => {}
            LockState::Spectatable | LockState::Locked if privileged => {}
            LockState::Spectatable => {
                return Err(format!(
                    "{} is spectate-only and you are not invited.",
                    self.name
                ))
            }
            LockState::Locked => return Err(format!("{} is locked.", self.name)),
        }
        match self.max_players {
            -1 => Ok(()),
            0 if is_moderator => Ok(()),
            0 => Err(format!("{} is inaccessible.", self.name)),
            cap if (self.occupants.len() as i64) < cap => Ok(()),
            _ if is_moderator => Ok(()),
            _ => Err(format!("{} is full.", self.name)),
        }
    }

    pub fn set_lock(&mut self, lock: LockState) {
        self.lock = lock;
        if lock == LockState::Free {
            self.invite_list.clear();
        }
    }

    /// Area-wide dialogue pacing. The window scales with message
    /// length up to a hard ceiling.
    pub fn pacing_delay(length: usize) -> Duration {
        let ms = (PACING_BASE_MS + PACING_PER_CHAR_MS * length as u64).min(PACING_CEILING_MS);
        Duration::from_millis(ms)
    }

    pub fn can_send_message(&self, now: Instant) -> bool {
        match self.next_message_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn note_message(&mut self, now: Instant, length: usize) {
        self.next_message_at = Some(now + Self::pacing_delay(length));
    }

    pub fn next_message_at(&self) -> Option<Instant> {
        self.next_message_at
    }

    pub fn push_judge_log(&mut self, entry: String) {
        if self.judge_log.len() == JUDGE_LOG_CAPACITY {
            self.judge_log.pop_front();
        }
        self.judge_log.push_back(entry);
    }

    pub fn judge_log(&self) -> impl Iterator<Item = &str> {
        self.judge_log.iter().map(String::as_str)
    }

    /// True when every index in `gate` names an existing piece of
    /// evidence here.
    pub fn satisfies_evidence_gate(&self, gate: &[usize]) -> bool {
        gate.iter().all(|&idx| idx < self.evidence.len())
    }
}

/// Default abbreviation: initials of a multi-word name, otherwise the
/// first three letters, uppercased.
pub fn derive_abbreviation(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.len() > 1 {
        words
            .iter()
            .filter_map(|word| word.chars().next())
            .map(|ch| ch.to_ascii_uppercase())
            .collect()
    } else {
        name.chars()
            .take(3)
            .map(|ch| ch.to_ascii_uppercase())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> Area {
        Area::new(0, "Courtroom 1", "default")
    }

    #[test]
    fn abbreviation_from_initials_or_prefix() {
        assert_eq!(derive_abbreviation("Courtroom 1"), "C1");
        assert_eq!(derive_abbreviation("Basement"), "BAS");
        assert_eq!(derive_abbreviation("Grand Hall West"), "GHW");
        assert_eq!(derive_abbreviation("A"), "A");
    }

    #[test]
    fn occupant_set_is_deduplicated() {
        let mut a = area();
        a.add_occupant(SessionId(1));
        a.add_occupant(SessionId(1));
        a.add_occupant(SessionId(2));
        assert_eq!(a.occupant_count(), 2);
        a.remove_occupant(SessionId(1));
        assert!(!a.contains(SessionId(1)));
        assert!(a.contains(SessionId(2)));
    }

    #[test]
    fn spectatable_blocks_interaction_for_outsiders_only() {
        let mut a = area();
        let outsider = SessionId(1);
        let invited = SessionId(2);
        let steward = SessionId(3);
        a.invite_list.insert(invited);
        a.owners.insert(steward);

        a.set_lock(LockState::Spectatable);
        assert!(a.cannot_interact(outsider, false));
        assert!(!a.cannot_interact(outsider, true));
        assert!(!a.cannot_interact(invited, false));
        assert!(!a.cannot_interact(steward, false));

        // A full lock never blocks interaction, only entry.
        a.set_lock(LockState::Free);
        a.set_lock(LockState::Locked);
        assert!(!a.cannot_interact(outsider, false));
    }

    #[test]
    fn lock_transitions_gate_entry_and_unlock_clears_invites() {
        let mut a = area();
        let outsider = SessionId(1);
        let invited = SessionId(2);
        a.invite_list.insert(invited);

        a.set_lock(LockState::Locked);
        assert!(a.may_enter(outsider, false).is_err());
        assert!(a.may_enter(outsider, true).is_ok());
        assert!(a.may_enter(invited, false).is_ok());

        a.set_lock(LockState::Free);
        assert!(a.invite_list.is_empty());
        assert!(a.may_enter(outsider, false).is_ok());
    }

    #[test]
    fn capacity_zero_closes_and_negative_lifts_cap() {
        let mut a = area();
        a.max_players = 0;
        assert!(a.may_enter(SessionId(1), false).is_err());
        assert!(a.may_enter(SessionId(1), true).is_ok());

        a.max_players = 1;
        assert!(a.may_enter(SessionId(1), false).is_ok());
        a.add_occupant(SessionId(9));
        assert!(a.may_enter(SessionId(1), false).is_err());

        a.max_players = -1;
        for id in 0..64 {
            a.add_occupant(SessionId(id));
        }
        assert!(a.may_enter(SessionId(100), false).is_ok());
    }

    #[test]
    fn pacing_window_scales_with_length_up_to_ceiling() {
        assert_eq!(Area::pacing_delay(0), Duration::from_millis(100));
        assert_eq!(Area::pacing_delay(10), Duration::from_millis(700));
        assert_eq!(Area::pacing_delay(50), Duration::from_millis(3000));
        assert_eq!(Area::pacing_delay(10_000), Duration::from_millis(3000));
    }

    #[test]
    fn pacing_blocks_until_window_elapses() {
        let mut a = area();
        let now = Instant::now();
        assert!(a.can_send_message(now));
        a.note_message(now, 10);
        assert!(!a.can_send_message(now));
        assert!(!a.can_send_message(now + Duration::from_millis(699)));
        assert!(a.can_send_message(now + Duration::from_millis(700)));
    }

    #[test]
    fn judge_log_keeps_last_ten_entries() {
        let mut a = area();
        for n in 0..15 {
            a.push_judge_log(format!("entry {}", n));
        }
        let entries: Vec<&str> = a.judge_log().collect();
        assert_eq!(entries.len(), JUDGE_LOG_CAPACITY);
        assert_eq!(entries[0], "entry 5");
        assert_eq!(entries[9], "entry 14");
    }

    #[test]
    fn evidence_gate_requires_existing_indices() {
        let mut a = area();
        assert!(a.satisfies_evidence_gate(&[]));
        assert!(!a.satisfies_evidence_gate(&[0]));
        a.evidence.push(Evidence::new(
            "Badge".into(),
            "shiny".into(),
            "badge.png".into(),
        ));
        assert!(a.satisfies_evidence_gate(&[0]));
        assert!(!a.satisfies_evidence_gate(&[0, 1]));
    }
}
