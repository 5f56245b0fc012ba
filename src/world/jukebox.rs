use crate::entities::session::SessionId;
use std::time::{SystemTime, UNIX_EPOCH};

/// Deterministic generator for jukebox draws. Seeded from the clock in
/// production and from a fixed value in tests.
#[derive(Debug, Clone)]
pub struct PickRng {
    state: u64,
}

impl PickRng {
    pub fn from_seed(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::from_seed(nanos)
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.state >> 32) as u32
    }

    /// Uniform draw in `0..bound`. `bound` of zero returns zero.
    pub fn pick(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        self.next_u32() % bound
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JukeboxVote {
    pub session: SessionId,
    pub track: String,
    /// Track length in seconds; zero or negative means "no scheduled
    /// advance" and the track plays until skipped.
    pub length: i64,
    pub showname: String,
    /// Rounds this vote has gone unchosen. Grows by one per losing
    /// round, resets when the vote wins.
    pub weight: u32,
}

/// Vote-driven music queue for one area. Selection favors tracks that
/// have waited: each vote contributes `max(weight, 1)` tickets to a
/// cumulative table and the winner is found by binary search over a
/// single uniform draw.
#[derive(Debug, Default)]
pub struct Jukebox {
    pub enabled: bool,
    votes: Vec<JukeboxVote>,
}

impl Jukebox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn votes(&self) -> &[JukeboxVote] {
        &self.votes
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Records a vote, replacing any earlier vote by the same session.
    /// Returns true when this was the first vote in the box, which is
    /// the signal to begin playback.
    pub fn cast_vote(&mut self, vote: JukeboxVote) -> bool {
        let was_empty = self.votes.is_empty();
        self.votes.retain(|existing| existing.session != vote.session);
        self.votes.push(vote);
        was_empty
    }

    /// Drops the vote held by `session`, if any.
    pub fn revoke_vote(&mut self, session: SessionId) -> bool {
        let before = self.votes.len();
        self.votes.retain(|vote| vote.session != session);
        self.votes.len() != before
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    /// Picks the next track to play. The winner's weight resets to
    /// zero and every loser's weight grows by one, so no vote starves.
    pub fn select_next(&mut self, rng: &mut PickRng) -> Option<JukeboxVote> {
        if self.votes.is_empty() {
            return None;
        }
        let winner_idx = if self.votes.len() == 1 {
            0
        } else {
            let mut cumulative = Vec::with_capacity(self.votes.len());
            let mut total = 0u32;
            for vote in &self.votes {
                total += vote.weight.max(1);
                cumulative.push(total);
            }
            let ticket = rng.pick(total);
            cumulative.partition_point(|&edge| edge <= ticket)
        };
        for (idx, vote) in self.votes.iter_mut().enumerate() {
            if idx == winner_idx {
                vote.weight = 0;
            } else {
                vote.weight += 1;
            }
        }
        self.votes.get(winner_idx).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(session: u32, track: &str) -> JukeboxVote {
        JukeboxVote {
            session: SessionId(session),
            track: track.to_string(),
            length: 120,
            showname: String::new(),
            weight: 0,
        }
    }

    #[test]
    fn first_vote_signals_playback_start() {
        let mut jukebox = Jukebox::new();
        assert!(jukebox.cast_vote(vote(1, "a.mp3")));
        assert!(!jukebox.cast_vote(vote(2, "b.mp3")));
        assert_eq!(jukebox.vote_count(), 2);
    }

    #[test]
    fn revote_replaces_earlier_vote_by_same_session() {
        let mut jukebox = Jukebox::new();
        jukebox.cast_vote(vote(1, "a.mp3"));
        jukebox.cast_vote(vote(1, "b.mp3"));
        assert_eq!(jukebox.vote_count(), 1);
        assert_eq!(jukebox.votes()[0].track, "b.mp3");
    }

    #[test]
    fn revoke_removes_only_that_sessions_vote() {
        let mut jukebox = Jukebox::new();
        jukebox.cast_vote(vote(1, "a.mp3"));
        jukebox.cast_vote(vote(2, "b.mp3"));
        assert!(jukebox.revoke_vote(SessionId(1)));
        assert!(!jukebox.revoke_vote(SessionId(1)));
        assert_eq!(jukebox.vote_count(), 1);
        assert_eq!(jukebox.votes()[0].session, SessionId(2));
    }

    #[test]
    fn single_vote_always_wins() {
        let mut jukebox = Jukebox::new();
        let mut rng = PickRng::from_seed(7);
        jukebox.cast_vote(vote(1, "a.mp3"));
        let picked = jukebox.select_next(&mut rng).expect("pick");
        assert_eq!(picked.track, "a.mp3");
        assert_eq!(jukebox.votes()[0].weight, 0);
    }

    #[test]
    fn losing_votes_gain_weight_each_round() {
        let mut jukebox = Jukebox::new();
        let mut rng = PickRng::from_seed(99);
        jukebox.cast_vote(vote(1, "a.mp3"));
        jukebox.cast_vote(vote(2, "b.mp3"));
        jukebox.cast_vote(vote(3, "c.mp3"));

        for round in 1..=64 {
            let winner = jukebox.select_next(&mut rng).expect("pick");
            for entry in jukebox.votes() {
                if entry.track == winner.track {
                    assert_eq!(entry.weight, 0);
                } else {
                    assert!(
                        entry.weight >= 1,
                        "loser weight should grow (round {})",
                        round
                    );
                }
            }
        }
    }

    #[test]
    fn waiting_track_is_eventually_selected() {
        let mut jukebox = Jukebox::new();
        let mut rng = PickRng::from_seed(0xfeed);
        jukebox.cast_vote(vote(1, "a.mp3"));
        jukebox.cast_vote(vote(2, "b.mp3"));
        jukebox.cast_vote(vote(3, "c.mp3"));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(jukebox.select_next(&mut rng).expect("pick").track);
        }
        assert_eq!(seen.len(), 3, "every vote must win at least once");
    }

    #[test]
    fn weight_strictly_increases_until_selected() {
        let mut jukebox = Jukebox::new();
        let mut rng = PickRng::from_seed(3);
        jukebox.cast_vote(vote(1, "a.mp3"));
        jukebox.cast_vote(vote(2, "b.mp3"));

        let mut last_b_weight = 0;
        for _ in 0..32 {
            let winner = jukebox.select_next(&mut rng).expect("pick");
            let b_weight = jukebox
                .votes()
                .iter()
                .find(|entry| entry.track == "b.mp3")
                .expect("b vote")
                .weight;
            if winner.track == "b.mp3" {
                assert_eq!(b_weight, 0);
            } else {
                assert_eq!(b_weight, last_b_weight + 1);
            }
            last_b_weight = b_weight;
        }
    }
}
