use crate::admin::commands;
use crate::entities::session::SessionId;
use crate::net::codec::WireMessage;
use crate::net::dispatch;
use crate::telemetry::logging;
use crate::world::hub::{HubState, IcMessage};
use std::time::Instant;

/// What the transport loop needs to know after one inbound message.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// The dedicated keepalive arrived; reset the idle clock.
    pub keepalive: bool,
}

/// Validates and routes one decoded message. Unknown verbs and
/// malformed arguments are dropped without reply; domain and
/// authorization failures are rendered back to the sender only.
pub fn handle_message(
    hub: &mut HubState,
    id: SessionId,
    message: &WireMessage,
    now: Instant,
) -> FrameOutcome {
    let mut outcome = FrameOutcome::default();
    let Some(spec) = dispatch::verb_spec(&message.verb) else {
        return outcome;
    };
    if !dispatch::validate(spec, &message.args) {
        return outcome;
    }
    let (joined, has_character) = match hub.session(id) {
        Some(session) => (session.is_joined(), session.has_character()),
        None => return outcome,
    };
    if spec.needs_join && !joined {
        return outcome;
    }
    if spec.needs_character && !has_character {
        return outcome;
    }

    let args = &message.args;
    let result = match message.verb.as_str() {
        "HI" => {
            hub.handle_handshake(id, &args[0]);
            Ok(())
        }
        "ID" => {
            let version = args.get(1).map(String::as_str).unwrap_or("");
            hub.handle_software_id(id, &args[0], version);
            Ok(())
        }
        "askchaa" => {
            hub.send_resource_counts(id);
            Ok(())
        }
        "RC" => {
            hub.send_character_roster(id);
            Ok(())
        }
        "RM" => {
            hub.send_music_list(id);
            Ok(())
        }
        "RD" => {
            hub.finish_join(id);
            Ok(())
        }
        "CC" => {
            let requested = parse_int(&args[1]);
            hub.select_character(id, requested)
        }
        "MS" => match IcMessage::from_args(args) {
            Some(message) => hub.handle_ic_message(id, message, now),
            None => Ok(()),
        },
        "CT" => {
            let name = &args[0];
            let text = &args[1];
            let ooc_muted = hub
                .session(id)
                .map(|session| session.ooc_muted)
                .unwrap_or(false);
            if ooc_muted {
                Err("Your out-of-character chat is muted.".to_string())
            } else if text.starts_with('/') {
                commands::dispatch_command(hub, id, text, now)
            } else {
                hub.handle_ooc_message(id, name, text)
            }
        }
        "MC" => {
            let showname = args.get(2).map(String::as_str).unwrap_or("");
            let effects = args.get(3).map(|value| parse_int(value)).unwrap_or(0);
            hub.handle_music_change(id, &args[0], showname, effects, now)
        }
        "RT" => {
            let variant = args.get(1).map(|value| parse_int(value));
            hub.handle_judge_signal(id, &args[0], variant)
        }
        "HP" => hub.handle_penalty(id, parse_int(&args[0]), parse_int(&args[1])),
        "PE" => hub.evidence_add(id, &args[0], &args[1], &args[2]),
        "DE" => hub.evidence_delete(id, parse_int(&args[0])),
        "EE" => hub.evidence_edit(id, parse_int(&args[0]), &args[1], &args[2], &args[3]),
        "ZZ" => {
            let reason = args.first().map(String::as_str).unwrap_or("");
            hub.handle_mod_call(id, reason, now)
        }
        "CH" => {
            outcome.keepalive = true;
            hub.send(id, "CHECK", &[]);
            Ok(())
        }
        other => {
            logging::log_error(&format!("verb {} has a spec but no handler", other));
            Ok(())
        }
    };
    if let Err(reason) = result {
        hub.send_host_message(id, &reason);
    }
    outcome
}

/// Validation has already guaranteed parseability for INTEGER slots.
fn parse_int(value: &str) -> i64 {
    value.trim().parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::hub::sample_hub;
    use std::net::{IpAddr, Ipv4Addr};

    fn message(verb: &str, args: &[&str]) -> WireMessage {
        WireMessage {
            verb: verb.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    fn connect(hub: &mut HubState, last_octet: u8) -> SessionId {
        let id = hub.register_session(IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet)));
        hub.take_outbox(id);
        id
    }

    fn join(hub: &mut HubState, last_octet: u8) -> SessionId {
        let id = connect(hub, last_octet);
        let now = Instant::now();
        handle_message(hub, id, &message("HI", &[&format!("hd{}", last_octet)]), now);
        handle_message(hub, id, &message("RD", &[]), now);
        hub.take_outbox(id);
        id
    }

    #[test]
    fn unknown_verb_is_silently_dropped() {
        let mut hub = sample_hub();
        let id = connect(&mut hub, 1);
        handle_message(&mut hub, id, &message("NOPE", &["x"]), Instant::now());
        let (frames, close) = hub.take_outbox(id);
        assert!(frames.is_empty());
        assert!(!close);
    }

    #[test]
    fn malformed_arguments_leave_no_trace() {
        let mut hub = sample_hub();
        let id = join(&mut hub, 1);
        // Wrong arity and a non-integer character id.
        handle_message(&mut hub, id, &message("CC", &["0"]), Instant::now());
        handle_message(&mut hub, id, &message("CC", &["0", "two", "hd1"]), Instant::now());
        assert_eq!(hub.session(id).unwrap().character, None);
        assert!(hub.take_outbox(id).0.is_empty());
    }

    #[test]
    fn full_join_sequence_reaches_area_zero() {
        let mut hub = sample_hub();
        let id = connect(&mut hub, 1);
        let now = Instant::now();
        handle_message(&mut hub, id, &message("HI", &["hd1"]), now);
        handle_message(&mut hub, id, &message("ID", &["webclient", "2.6"]), now);
        handle_message(&mut hub, id, &message("askchaa", &[]), now);
        handle_message(&mut hub, id, &message("RC", &[]), now);
        handle_message(&mut hub, id, &message("RM", &[]), now);
        handle_message(&mut hub, id, &message("RD", &[]), now);
        let (frames, _) = hub.take_outbox(id);
        let starts = |prefix: &str| frames.iter().any(|frame| frame.starts_with(prefix));
        assert!(starts("ID#"));
        assert!(starts("FL#"));
        assert!(starts("SI#4#0#"));
        assert!(starts("SC#Phoenix#Edgeworth#Maya#Gumshoe"));
        assert!(starts("SM#Lobby#Courtroom 1#Courtroom 2#== Trial ==#objection.mp3"));
        assert!(starts("CharsCheck#"));
        assert!(starts("DONE"));
        assert!(hub.area(0).unwrap().contains(id));
    }

    #[test]
    fn dialogue_requires_a_selected_character() {
        let mut hub = sample_hub();
        let id = join(&mut hub, 1);
        let mut args = vec!["chat", "-", "Phoenix", "normal", "hi", "wit", "1"];
        args.extend(["0", "0", "0", "0", "0", "0", "0", "0"]);
        handle_message(&mut hub, id, &message("MS", &args), Instant::now());
        // Spectator dialogue is a silent no-op.
        assert!(hub.take_outbox(id).0.is_empty());
    }

    #[test]
    fn keepalive_acknowledges_and_reports() {
        let mut hub = sample_hub();
        let id = connect(&mut hub, 1);
        let outcome = handle_message(&mut hub, id, &message("CH", &["-1"]), Instant::now());
        assert!(outcome.keepalive);
        let (frames, _) = hub.take_outbox(id);
        assert_eq!(frames, vec!["CHECK#%".to_string()]);
    }

    #[test]
    fn slash_text_routes_to_the_command_interpreter() {
        let mut hub = sample_hub();
        let id = join(&mut hub, 1);
        handle_message(
            &mut hub,
            id,
            &message("CT", &["someone", "/pos def"]),
            Instant::now(),
        );
        assert_eq!(hub.session(id).unwrap().sticky_pos.as_deref(), Some("def"));
        // Unknown commands come back as a host line to the sender only.
        handle_message(
            &mut hub,
            id,
            &message("CT", &["someone", "/frobnicate"]),
            Instant::now(),
        );
        let (frames, _) = hub.take_outbox(id);
        assert!(frames
            .iter()
            .any(|frame| frame.starts_with("CT#oyez#") && frame.contains("Unknown command")));
    }

    #[test]
    fn plain_ooc_text_broadcasts_to_the_area() {
        let mut hub = sample_hub();
        let speaker = join(&mut hub, 1);
        let listener = join(&mut hub, 2);
        handle_message(
            &mut hub,
            speaker,
            &message("CT", &["Nick", "hello all"]),
            Instant::now(),
        );
        let (frames, _) = hub.take_outbox(listener);
        assert!(frames.iter().any(|frame| frame == "CT#Nick#hello all#%"));
    }

    #[test]
    fn domain_errors_render_as_host_messages() {
        let mut hub = sample_hub();
        let id = join(&mut hub, 1);
        handle_message(&mut hub, id, &message("CC", &["0", "0", "hd1"]), Instant::now());
        hub.take_outbox(id);
        // Penalty outside 0..=10 is a domain error.
        handle_message(&mut hub, id, &message("HP", &["1", "11"]), Instant::now());
        let (frames, _) = hub.take_outbox(id);
        assert!(frames
            .iter()
            .any(|frame| frame.starts_with("CT#oyez#") && frame.contains("Invalid penalty")));
    }
}
