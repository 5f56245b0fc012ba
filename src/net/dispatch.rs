use std::collections::HashMap;
use std::sync::OnceLock;

/// What a handler expects at one argument slot. Validation fails
/// closed: a mismatch aborts the whole message with no side effect and
/// no reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Non-empty string.
    Str,
    /// String, possibly empty.
    StrOrEmpty,
    /// Must parse as a signed integer.
    Int,
}

use ArgKind::{Int, Str, StrOrEmpty};

#[derive(Debug)]
pub struct VerbSpec {
    pub verb: &'static str,
    /// Requires the session to have completed the join handshake.
    pub needs_join: bool,
    /// Requires a selected character (spectators are rejected
    /// silently).
    pub needs_character: bool,
    pub min_args: usize,
    /// One kind per accepted slot; the slice length is the maximum
    /// accepted arity.
    pub kinds: &'static [ArgKind],
}

/// Dialogue messages: fifteen core fields shared by every client
/// generation, then optional extensions accepted as a prefix.
const MS_KINDS: [ArgKind; 26] = [
    StrOrEmpty, // desk mod
    StrOrEmpty, // preanim
    StrOrEmpty, // character folder
    StrOrEmpty, // anim
    StrOrEmpty, // text
    StrOrEmpty, // position
    StrOrEmpty, // sfx
    Int,        // emote mod
    Int,        // character id
    Int,        // sfx delay
    StrOrEmpty, // shout
    Int,        // evidence
    Int,        // flip
    Int,        // realization
    Int,        // text color
    StrOrEmpty, // showname
    StrOrEmpty, // paired character
    StrOrEmpty, // pair offset
    StrOrEmpty, // non-interrupting preanim
    StrOrEmpty, // sfx looping
    StrOrEmpty, // screenshake
    StrOrEmpty, // shake frames
    StrOrEmpty, // realization frames
    StrOrEmpty, // sfx frames
    StrOrEmpty, // additive
    StrOrEmpty, // effect
];

const VERBS: &[VerbSpec] = &[
    VerbSpec {
        verb: "HI",
        needs_join: false,
        needs_character: false,
        min_args: 1,
        kinds: &[Str],
    },
    VerbSpec {
        verb: "ID",
        needs_join: false,
        needs_character: false,
        min_args: 1,
        kinds: &[Str, StrOrEmpty],
    },
    VerbSpec {
        verb: "askchaa",
        needs_join: false,
        needs_character: false,
        min_args: 0,
        kinds: &[],
    },
    VerbSpec {
        verb: "RC",
        needs_join: false,
        needs_character: false,
        min_args: 0,
        kinds: &[],
    },
    VerbSpec {
        verb: "RM",
        needs_join: false,
        needs_character: false,
        min_args: 0,
        kinds: &[],
    },
    VerbSpec {
        verb: "RD",
        needs_join: false,
        needs_character: false,
        min_args: 0,
        kinds: &[],
    },
    VerbSpec {
        verb: "CC",
        needs_join: true,
        needs_character: false,
        min_args: 3,
        kinds: &[Int, Int, Str],
    },
    VerbSpec {
        verb: "MS",
        needs_join: true,
        needs_character: true,
        min_args: 15,
        kinds: &MS_KINDS,
    },
    VerbSpec {
        verb: "CT",
        needs_join: true,
        needs_character: false,
        min_args: 2,
        kinds: &[Str, Str],
    },
    VerbSpec {
        verb: "MC",
        needs_join: true,
        needs_character: true,
        min_args: 2,
        kinds: &[Str, Int, StrOrEmpty, Int],
    },
    VerbSpec {
        verb: "RT",
        needs_join: true,
        needs_character: true,
        min_args: 1,
        kinds: &[Str, Int],
    },
    VerbSpec {
        verb: "HP",
        needs_join: true,
        needs_character: true,
        min_args: 2,
        kinds: &[Int, Int],
    },
    VerbSpec {
        verb: "PE",
        needs_join: true,
        needs_character: true,
        min_args: 3,
        kinds: &[StrOrEmpty, StrOrEmpty, StrOrEmpty],
    },
    VerbSpec {
        verb: "DE",
        needs_join: true,
        needs_character: true,
        min_args: 1,
        kinds: &[Int],
    },
    VerbSpec {
        verb: "EE",
        needs_join: true,
        needs_character: true,
        min_args: 4,
        kinds: &[Int, StrOrEmpty, StrOrEmpty, StrOrEmpty],
    },
    VerbSpec {
        verb: "ZZ",
        needs_join: true,
        needs_character: false,
        min_args: 0,
        kinds: &[StrOrEmpty],
    },
    VerbSpec {
        verb: "CH",
        needs_join: false,
        needs_character: false,
        min_args: 1,
        kinds: &[Int],
    },
];

/// Immutable verb table, built once. Unknown verbs resolve to `None`
/// and the message is dropped.
pub fn verb_spec(verb: &str) -> Option<&'static VerbSpec> {
    static TABLE: OnceLock<HashMap<&'static str, &'static VerbSpec>> = OnceLock::new();
    let table = TABLE.get_or_init(|| VERBS.iter().map(|spec| (spec.verb, spec)).collect());
    table.get(verb).copied()
}

pub fn validate(spec: &VerbSpec, args: &[String]) -> bool {
    if args.len() < spec.min_args || args.len() > spec.kinds.len() {
        return false;
    }
    for (arg, kind) in args.iter().zip(spec.kinds.iter()) {
        match kind {
            Str => {
                if arg.is_empty() {
                    return false;
                }
            }
            StrOrEmpty => {}
            Int => {
                if arg.trim().parse::<i64>().is_err() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn unknown_verbs_resolve_to_none() {
        assert!(verb_spec("NOPE").is_none());
        assert!(verb_spec("hi").is_none());
        assert!(verb_spec("HI").is_some());
    }

    #[test]
    fn arity_is_enforced_both_ways() {
        let spec = verb_spec("CC").unwrap();
        assert!(validate(spec, &args(&["0", "2", "hdid"])));
        assert!(!validate(spec, &args(&["0", "2"])));
        assert!(!validate(spec, &args(&["0", "2", "hdid", "extra"])));
    }

    #[test]
    fn integer_arguments_must_parse() {
        let spec = verb_spec("HP").unwrap();
        assert!(validate(spec, &args(&["1", "5"])));
        assert!(validate(spec, &args(&["2", "-1"])));
        assert!(!validate(spec, &args(&["one", "5"])));
        assert!(!validate(spec, &args(&["1", ""])));
    }

    #[test]
    fn required_strings_reject_empty() {
        let spec = verb_spec("HI").unwrap();
        assert!(validate(spec, &args(&["abc123"])));
        assert!(!validate(spec, &args(&[""])));
    }

    #[test]
    fn optional_trailing_arguments_are_accepted() {
        let spec = verb_spec("MC").unwrap();
        assert!(validate(spec, &args(&["track.mp3", "2"])));
        assert!(validate(spec, &args(&["track.mp3", "2", "Nick"])));
        assert!(validate(spec, &args(&["track.mp3", "2", "", "4"])));
        assert!(!validate(spec, &args(&["track.mp3", "2", "", "notint"])));

        let spec = verb_spec("ZZ").unwrap();
        assert!(validate(spec, &args(&[])));
        assert!(validate(spec, &args(&["please help"])));
    }

    #[test]
    fn dialogue_accepts_core_and_extended_arity() {
        let spec = verb_spec("MS").unwrap();
        let mut core = vec!["x".to_string(); 15];
        for idx in [7, 8, 9, 11, 12, 13, 14] {
            core[idx] = "0".to_string();
        }
        assert!(validate(spec, &core));
        let mut extended = core.clone();
        extended.extend(vec!["".to_string(); 11]);
        assert!(validate(spec, &extended));
        let mut too_many = extended.clone();
        too_many.push("overflow".to_string());
        assert!(!validate(spec, &too_many));
        let short = vec!["x".to_string(); 14];
        assert!(!validate(spec, &short));
    }
}
