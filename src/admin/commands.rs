use crate::entities::session::{ListenFilter, SessionId};
use crate::world::area::LockState;
use crate::world::hub::{HubState, ModFlag};
use crate::world::timer::parse_duration;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Who may run a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandGate {
    Anyone,
    /// A steward of the caller's current area, or a moderator.
    Steward,
    Moderator,
}

type CommandHandler = fn(&mut HubState, SessionId, &str, Instant) -> Result<(), String>;

pub struct OocCommandSpec {
    pub name: &'static str,
    pub gate: CommandGate,
    handler: CommandHandler,
}

const COMMANDS: &[OocCommandSpec] = &[
    // Self-service.
    OocCommandSpec { name: "pos", gate: CommandGate::Anyone, handler: cmd_pos },
    OocCommandSpec { name: "listenpos", gate: CommandGate::Anyone, handler: cmd_listenpos },
    OocCommandSpec { name: "area", gate: CommandGate::Anyone, handler: cmd_area },
    OocCommandSpec { name: "getarea", gate: CommandGate::Anyone, handler: cmd_getarea },
    OocCommandSpec { name: "getareas", gate: CommandGate::Anyone, handler: cmd_getareas },
    OocCommandSpec { name: "peek", gate: CommandGate::Anyone, handler: cmd_peek },
    OocCommandSpec { name: "motd", gate: CommandGate::Anyone, handler: cmd_motd },
    OocCommandSpec { name: "login", gate: CommandGate::Anyone, handler: cmd_login },
    OocCommandSpec { name: "need", gate: CommandGate::Anyone, handler: cmd_need },
    // Area stewardship.
    OocCommandSpec { name: "lock", gate: CommandGate::Steward, handler: cmd_lock },
    OocCommandSpec { name: "spectatable", gate: CommandGate::Steward, handler: cmd_spectatable },
    OocCommandSpec { name: "unlock", gate: CommandGate::Steward, handler: cmd_unlock },
    OocCommandSpec { name: "invite", gate: CommandGate::Steward, handler: cmd_invite },
    OocCommandSpec { name: "uninvite", gate: CommandGate::Steward, handler: cmd_uninvite },
    OocCommandSpec { name: "cm", gate: CommandGate::Anyone, handler: cmd_cm },
    OocCommandSpec { name: "uncm", gate: CommandGate::Steward, handler: cmd_uncm },
    OocCommandSpec { name: "bg", gate: CommandGate::Steward, handler: cmd_bg },
    OocCommandSpec { name: "poslock", gate: CommandGate::Steward, handler: cmd_poslock },
    OocCommandSpec { name: "link", gate: CommandGate::Steward, handler: cmd_link },
    OocCommandSpec { name: "unlink", gate: CommandGate::Steward, handler: cmd_unlink },
    OocCommandSpec { name: "link_lock", gate: CommandGate::Steward, handler: cmd_link_lock },
    OocCommandSpec { name: "link_unlock", gate: CommandGate::Steward, handler: cmd_link_unlock },
    OocCommandSpec { name: "link_hide", gate: CommandGate::Steward, handler: cmd_link_hide },
    OocCommandSpec { name: "link_unhide", gate: CommandGate::Steward, handler: cmd_link_unhide },
    OocCommandSpec { name: "link_pos", gate: CommandGate::Steward, handler: cmd_link_pos },
    OocCommandSpec { name: "link_peek", gate: CommandGate::Steward, handler: cmd_link_peek },
    OocCommandSpec { name: "link_evidence", gate: CommandGate::Steward, handler: cmd_link_evidence },
    OocCommandSpec { name: "timer", gate: CommandGate::Steward, handler: cmd_timer },
    OocCommandSpec { name: "jukebox", gate: CommandGate::Steward, handler: cmd_jukebox },
    OocCommandSpec { name: "jukebox_skip", gate: CommandGate::Steward, handler: cmd_jukebox_skip },
    // Moderation.
    OocCommandSpec { name: "mute", gate: CommandGate::Moderator, handler: cmd_mute },
    OocCommandSpec { name: "unmute", gate: CommandGate::Moderator, handler: cmd_unmute },
    OocCommandSpec { name: "oocmute", gate: CommandGate::Moderator, handler: cmd_oocmute },
    OocCommandSpec { name: "oocunmute", gate: CommandGate::Moderator, handler: cmd_oocunmute },
    OocCommandSpec { name: "blockdj", gate: CommandGate::Moderator, handler: cmd_blockdj },
    OocCommandSpec { name: "unblockdj", gate: CommandGate::Moderator, handler: cmd_unblockdj },
    OocCommandSpec { name: "blockwtce", gate: CommandGate::Moderator, handler: cmd_blockwtce },
    OocCommandSpec { name: "unblockwtce", gate: CommandGate::Moderator, handler: cmd_unblockwtce },
    OocCommandSpec { name: "blind", gate: CommandGate::Moderator, handler: cmd_blind },
    OocCommandSpec { name: "unblind", gate: CommandGate::Moderator, handler: cmd_unblind },
    OocCommandSpec { name: "charcurse", gate: CommandGate::Moderator, handler: cmd_charcurse },
    OocCommandSpec { name: "uncharcurse", gate: CommandGate::Moderator, handler: cmd_uncharcurse },
    OocCommandSpec { name: "kick", gate: CommandGate::Moderator, handler: cmd_kick },
    OocCommandSpec { name: "ban", gate: CommandGate::Moderator, handler: cmd_ban },
    OocCommandSpec { name: "unban", gate: CommandGate::Moderator, handler: cmd_unban },
    OocCommandSpec { name: "announce", gate: CommandGate::Moderator, handler: cmd_announce },
];

/// Immutable command registry, keyed by lowercase name and built once
/// at first use.
fn registry() -> &'static HashMap<&'static str, &'static OocCommandSpec> {
    static REGISTRY: OnceLock<HashMap<&'static str, &'static OocCommandSpec>> = OnceLock::new();
    REGISTRY.get_or_init(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect())
}

/// Entry point for `/`-prefixed out-of-character text. Errors render
/// as a host line to the caller only.
pub fn dispatch_command(
    hub: &mut HubState,
    id: SessionId,
    text: &str,
    now: Instant,
) -> Result<(), String> {
    let body = text.strip_prefix('/').unwrap_or(text);
    let mut parts = body.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_ascii_lowercase();
    let rest = parts.next().unwrap_or("").trim().to_string();
    let spec = registry()
        .get(name.as_str())
        .copied()
        .ok_or_else(|| "Unknown command.".to_string())?;
    match spec.gate {
        CommandGate::Anyone => {}
        CommandGate::Steward => {
            let (is_moderator, area_id) = caller_standing(hub, id)?;
            let is_steward = hub
                .area(area_id)
                .map(|area| area.is_owner(id))
                .unwrap_or(false);
            if !is_moderator && !is_steward {
                return Err("Only a steward or moderator may do that.".to_string());
            }
        }
        CommandGate::Moderator => {
            let (is_moderator, _) = caller_standing(hub, id)?;
            if !is_moderator {
                return Err("Moderators only.".to_string());
            }
        }
    }
    (spec.handler)(hub, id, &rest, now)
}

fn caller_standing(hub: &HubState, id: SessionId) -> Result<(bool, usize), String> {
    hub.session(id)
        .map(|session| (session.is_moderator, session.area_id))
        .ok_or_else(|| "unknown session".to_string())
}

// ---- argument helpers ------------------------------------------------------

fn first_token(rest: &str) -> (&str, &str) {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let token = parts.next().unwrap_or("");
    let remainder = parts.next().unwrap_or("").trim();
    (token, remainder)
}

fn parse_client_id(token: &str) -> Result<SessionId, String> {
    token
        .parse::<u32>()
        .map(SessionId)
        .map_err(|_| format!("'{}' is not a client id.", token))
}

fn parse_area_ref(hub: &HubState, token: &str) -> Result<usize, String> {
    if let Ok(id) = token.parse::<usize>() {
        if id < hub.area_count() {
            return Ok(id);
        }
    }
    hub.area_id_by_name(token)
        .ok_or_else(|| format!("'{}' names no area.", token))
}

fn require_arg<'a>(rest: &'a str, usage: &str) -> Result<&'a str, String> {
    if rest.is_empty() {
        Err(format!("Usage: {}", usage))
    } else {
        Ok(rest)
    }
}

// ---- self-service -----------------------------------------------------------

fn cmd_pos(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    if rest.is_empty() {
        hub.session_mut(id).ok_or("unknown session")?.sticky_pos = None;
        hub.send_host_message(id, "Your position is no longer fixed.");
    } else {
        let pos = first_token(rest).0.to_ascii_lowercase();
        hub.session_mut(id).ok_or("unknown session")?.sticky_pos = Some(pos.clone());
        hub.send_host_message(id, &format!("Position set to '{}'.", pos));
    }
    Ok(())
}

fn cmd_listenpos(
    hub: &mut HubState,
    id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let filter = match rest {
        "" | "off" => None,
        "self" => Some(ListenFilter::OwnPosition),
        list => Some(ListenFilter::Positions(
            list.split_whitespace()
                .map(|pos| pos.to_ascii_lowercase())
                .collect(),
        )),
    };
    let notice = match &filter {
        None => "You hear every position again.".to_string(),
        Some(ListenFilter::OwnPosition) => "You now listen to your own position only.".to_string(),
        Some(ListenFilter::Positions(list)) => {
            format!("You now listen to: {}.", list.join(", "))
        }
    };
    hub.session_mut(id).ok_or("unknown session")?.listen_filter = filter;
    hub.send_host_message(id, &notice);
    Ok(())
}

fn cmd_area(hub: &mut HubState, id: SessionId, rest: &str, now: Instant) -> Result<(), String> {
    if rest.is_empty() {
        let listing = hub.area_listing();
        hub.send_host_message(id, &listing);
        return Ok(());
    }
    let dest = parse_area_ref(hub, rest)?;
    hub.try_move(id, dest, now)
}

fn cmd_getarea(hub: &mut HubState, id: SessionId, _rest: &str, _now: Instant) -> Result<(), String> {
    let area_id = hub.session(id).ok_or("unknown session")?.area_id;
    let text = hub.area_roll_call(area_id)?;
    hub.send_host_message(id, &text);
    Ok(())
}

fn cmd_getareas(
    hub: &mut HubState,
    id: SessionId,
    _rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let text = hub.full_roll_call();
    hub.send_host_message(id, &text);
    Ok(())
}

fn cmd_peek(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/peek <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.peek(id, dest)
}

fn cmd_motd(hub: &mut HubState, id: SessionId, _rest: &str, _now: Instant) -> Result<(), String> {
    hub.send_motd(id);
    Ok(())
}

fn cmd_login(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let password = require_arg(rest, "/login <password>")?;
    if hub.session(id).map(|s| s.is_moderator).unwrap_or(false) {
        return Err("You are already logged in.".to_string());
    }
    hub.login_moderator(id, password)
}

fn cmd_need(hub: &mut HubState, id: SessionId, rest: &str, now: Instant) -> Result<(), String> {
    let text = require_arg(rest, "/need <description>")?;
    hub.case_announcement(id, text, now)
}

// ---- stewardship ------------------------------------------------------------

fn cmd_lock(hub: &mut HubState, id: SessionId, _rest: &str, _now: Instant) -> Result<(), String> {
    hub.lock_area(id, LockState::Locked)
}

fn cmd_spectatable(
    hub: &mut HubState,
    id: SessionId,
    _rest: &str,
    _now: Instant,
) -> Result<(), String> {
    hub.lock_area(id, LockState::Spectatable)
}

fn cmd_unlock(hub: &mut HubState, id: SessionId, _rest: &str, _now: Instant) -> Result<(), String> {
    hub.lock_area(id, LockState::Free)
}

fn cmd_invite(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/invite <client id>")?;
    let target = parse_client_id(first_token(token).0)?;
    hub.invite(id, target)
}

fn cmd_uninvite(
    hub: &mut HubState,
    id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let token = require_arg(rest, "/uninvite <client id>")?;
    let target = parse_client_id(first_token(token).0)?;
    hub.uninvite(id, target)
}

fn cmd_cm(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let target = if rest.is_empty() {
        None
    } else {
        Some(parse_client_id(first_token(rest).0)?)
    };
    hub.claim_stewardship(id, target)
}

fn cmd_uncm(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let target = if rest.is_empty() {
        None
    } else {
        Some(parse_client_id(first_token(rest).0)?)
    };
    hub.drop_stewardship(id, target)
}

fn cmd_bg(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let background = require_arg(rest, "/bg <background>")?;
    hub.set_background(id, background)
}

fn cmd_poslock(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let spec = require_arg(rest, "/poslock <positions...|clear>")?;
    let positions = if spec.eq_ignore_ascii_case("clear") {
        Vec::new()
    } else {
        spec.split_whitespace()
            .map(|pos| pos.to_ascii_lowercase())
            .collect()
    };
    hub.set_position_lock(id, positions)
}

fn cmd_link(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/link <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.link_areas(id, dest)
}

fn cmd_unlink(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/unlink <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.unlink_areas(id, dest)
}

fn cmd_link_lock(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/link_lock <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.edit_link(id, dest, |link| link.locked = true)
}

fn cmd_link_unlock(
    hub: &mut HubState,
    id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let token = require_arg(rest, "/link_unlock <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.edit_link(id, dest, |link| link.locked = false)
}

fn cmd_link_hide(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/link_hide <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.edit_link(id, dest, |link| link.hidden = true)
}

fn cmd_link_unhide(
    hub: &mut HubState,
    id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let token = require_arg(rest, "/link_unhide <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.edit_link(id, dest, |link| link.hidden = false)
}

fn cmd_link_pos(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let spec = require_arg(rest, "/link_pos <area> <position>")?;
    let (area_token, pos) = first_token(spec);
    let dest = parse_area_ref(hub, area_token)?;
    let position = pos.to_ascii_lowercase();
    hub.edit_link(id, dest, move |link| link.target_position = position)
}

fn cmd_link_peek(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/link_peek <area>")?;
    let dest = parse_area_ref(hub, token)?;
    hub.edit_link(id, dest, |link| link.can_peek = !link.can_peek)
}

fn cmd_link_evidence(
    hub: &mut HubState,
    id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let spec = require_arg(rest, "/link_evidence <area> [evidence ids...]")?;
    let (area_token, ids) = first_token(spec);
    let dest = parse_area_ref(hub, area_token)?;
    let mut gate = Vec::new();
    for token in ids.split_whitespace() {
        let idx = token
            .parse::<usize>()
            .map_err(|_| format!("'{}' is not an evidence id.", token))?;
        gate.push(idx);
    }
    hub.edit_link(id, dest, move |link| link.evidence_gate = gate)
}

fn cmd_timer(hub: &mut HubState, id: SessionId, rest: &str, now: Instant) -> Result<(), String> {
    let spec = require_arg(rest, "/timer <id> [<duration>|+d|-d|start|pause|unset]")?;
    let (id_token, action) = first_token(spec);
    let timer_id = id_token
        .parse::<usize>()
        .map_err(|_| format!("'{}' is not a timer id.", id_token))?;
    match action {
        "" => hub.timer_status(id, timer_id, now),
        "start" => hub.timer_start(id, timer_id, now),
        "pause" => hub.timer_pause(id, timer_id, now),
        "unset" | "hide" => hub.timer_unset(id, timer_id, now),
        value => {
            if let Some(delta) = value.strip_prefix('+') {
                hub.timer_adjust(id, timer_id, parse_duration(delta)?, true, now)
            } else if let Some(delta) = value.strip_prefix('-') {
                hub.timer_adjust(id, timer_id, parse_duration(delta)?, false, now)
            } else {
                hub.timer_set(id, timer_id, parse_duration(value)?, now)
            }
        }
    }
}

fn cmd_jukebox(hub: &mut HubState, id: SessionId, _rest: &str, now: Instant) -> Result<(), String> {
    hub.toggle_jukebox(id, now)
}

fn cmd_jukebox_skip(
    hub: &mut HubState,
    id: SessionId,
    _rest: &str,
    now: Instant,
) -> Result<(), String> {
    hub.jukebox_skip(id, now)
}

// ---- moderation ---------------------------------------------------------

fn flag_command(
    hub: &mut HubState,
    rest: &str,
    usage: &str,
    flag: ModFlag,
    value: bool,
) -> Result<(), String> {
    let token = require_arg(rest, usage)?;
    let target = parse_client_id(first_token(token).0)?;
    hub.set_mod_flag(target, flag, value)
}

fn cmd_mute(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/mute <client id>", ModFlag::IcMute, true)
}

fn cmd_unmute(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/unmute <client id>", ModFlag::IcMute, false)
}

fn cmd_oocmute(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/oocmute <client id>", ModFlag::OocMute, true)
}

fn cmd_oocunmute(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    flag_command(hub, rest, "/oocunmute <client id>", ModFlag::OocMute, false)
}

fn cmd_blockdj(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/blockdj <client id>", ModFlag::Dj, true)
}

fn cmd_unblockdj(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    flag_command(hub, rest, "/unblockdj <client id>", ModFlag::Dj, false)
}

fn cmd_blockwtce(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    flag_command(
        hub,
        rest,
        "/blockwtce <client id>",
        ModFlag::JudgeControls,
        true,
    )
}

fn cmd_unblockwtce(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    flag_command(
        hub,
        rest,
        "/unblockwtce <client id>",
        ModFlag::JudgeControls,
        false,
    )
}

fn cmd_blind(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/blind <client id>", ModFlag::Blind, true)
}

fn cmd_unblind(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    flag_command(hub, rest, "/unblind <client id>", ModFlag::Blind, false)
}

fn cmd_charcurse(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let spec = require_arg(rest, "/charcurse <client id> <character ids...>")?;
    let (target_token, ids) = first_token(spec);
    let target = parse_client_id(target_token)?;
    let mut allowed = Vec::new();
    for token in ids.split_whitespace() {
        let idx = token
            .parse::<usize>()
            .map_err(|_| format!("'{}' is not a character id.", token))?;
        allowed.push(idx);
    }
    if allowed.is_empty() {
        return Err("Usage: /charcurse <client id> <character ids...>".to_string());
    }
    hub.set_charcurse(target, allowed)
}

fn cmd_uncharcurse(
    hub: &mut HubState,
    _id: SessionId,
    rest: &str,
    _now: Instant,
) -> Result<(), String> {
    let token = require_arg(rest, "/uncharcurse <client id>")?;
    let target = parse_client_id(first_token(token).0)?;
    hub.clear_charcurse(target)
}

fn cmd_kick(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let spec = require_arg(rest, "/kick <client id> [reason]")?;
    let (target_token, reason) = first_token(spec);
    let target = parse_client_id(target_token)?;
    hub.kick(id, target, reason)
}

fn cmd_ban(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let spec = require_arg(rest, "/ban <client id> [reason]")?;
    let (target_token, reason) = first_token(spec);
    let target = parse_client_id(target_token)?;
    hub.ban(id, target, reason)
}

fn cmd_unban(hub: &mut HubState, id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let token = require_arg(rest, "/unban <ipid|hdid>")?;
    hub.unban(first_token(token).0)?;
    hub.send_host_message(id, "Ban lifted.");
    Ok(())
}

fn cmd_announce(hub: &mut HubState, _id: SessionId, rest: &str, _now: Instant) -> Result<(), String> {
    let text = require_arg(rest, "/announce <text>")?;
    hub.announce(text);
    Ok(())
}
