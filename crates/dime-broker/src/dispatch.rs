use std::collections::HashMap;

use bytes::Bytes;
use dime_proto::{Frame, Header, Serialization, command, field};
use mio::Token;
use serde_json::Value;

use crate::client::Client;
use crate::registry::GroupRegistry;

pub type ClientTable = HashMap<Token, Client>;

/// Interprets one inbound frame from `from`, mutating client state and the
/// group registry, and appends every direct response this produces to
/// `responses` as `(target, frame)` pairs.
///
/// Most commands only ever push one entry, addressed back to `from`. `send`
/// and `broadcast` can also push a response for a *different* token: when
/// delivery lands on a connection parked in `wait`, that wait is released
/// right here, in the same dispatch call that caused it.
pub fn dispatch(
    clients: &mut ClientTable,
    groups: &mut GroupRegistry,
    from: Token,
    frame: Frame,
    responses: &mut Vec<(Token, Frame)>,
    outbox_cap_bytes: Option<usize>,
) {
    let Some(cmd) = frame.command().map(str::to_owned) else {
        responses.push((from, protocol_error("missing \"command\" field")));
        return;
    };

    match cmd.as_str() {
        command::HANDSHAKE => handle_handshake(clients, from, &frame, responses),
        command::JOIN => handle_join(clients, groups, from, &frame, responses),
        command::LEAVE => handle_leave(clients, groups, from, &frame, responses),
        command::SEND => handle_send(clients, groups, from, frame, responses, outbox_cap_bytes),
        command::BROADCAST => handle_broadcast(clients, from, frame, responses, outbox_cap_bytes),
        command::SYNC => handle_sync(clients, from, &frame, responses),
        command::WAIT => handle_wait(clients, from, responses),
        command::DEVICES => handle_devices(groups, from, responses),
        other => responses.push((from, protocol_error(format!("unknown command: {other}")))),
    }
}

fn handle_handshake(clients: &mut ClientTable, from: Token, frame: &Frame, responses: &mut Vec<(Token, Frame)>) {
    let Some(client) = clients.get_mut(&from) else { return };
    let requested = frame.header.get(field::SERIALIZATION).and_then(Value::as_str);
    let chosen = requested.and_then(Serialization::parse).unwrap_or_default();
    client.state.serialization = chosen;
    client.state.handshaked = true;
    responses.push((
        from,
        ok_with(|h| {
            h.insert(field::SERIALIZATION.to_owned(), Value::from(chosen.as_str()));
        }),
    ));
}

fn handle_join(
    clients: &mut ClientTable,
    groups: &mut GroupRegistry,
    from: Token,
    frame: &Frame,
    responses: &mut Vec<(Token, Frame)>,
) {
    let names = names_from_header(&frame.header);
    if names.is_empty() {
        responses.push((from, protocol_error("join requires \"name\"")));
        return;
    }
    let Some(client) = clients.get_mut(&from) else { return };
    groups.join(from, &mut client.state, names);
    responses.push((from, ok()));
}

fn handle_leave(
    clients: &mut ClientTable,
    groups: &mut GroupRegistry,
    from: Token,
    frame: &Frame,
    responses: &mut Vec<(Token, Frame)>,
) {
    let names = names_from_header(&frame.header);
    if names.is_empty() {
        responses.push((from, protocol_error("leave requires \"name\"")));
        return;
    }
    let Some(client) = clients.get_mut(&from) else { return };
    groups.leave(from, &mut client.state, names);
    responses.push((from, ok()));
}

/// Appends the frame to every current member of `name`, excluding `from`. An
/// absent or empty group is not an error: the frame is dropped and the
/// sender still gets `{status:0}`.
fn handle_send(
    clients: &mut ClientTable,
    groups: &GroupRegistry,
    from: Token,
    frame: Frame,
    responses: &mut Vec<(Token, Frame)>,
    outbox_cap_bytes: Option<usize>,
) {
    let Some(name) = frame.header.get(field::NAME).and_then(Value::as_str).map(str::to_owned) else {
        responses.push((from, protocol_error("send requires \"name\"")));
        return;
    };
    let targets: Vec<Token> = groups.members(&name).filter(|t| *t != from).collect();
    for target in targets {
        deliver(clients, target, frame.clone(), responses, outbox_cap_bytes);
    }
    responses.push((from, ok()));
}

/// Appends the frame to every other connected client, sender excluded.
fn handle_broadcast(
    clients: &mut ClientTable,
    from: Token,
    frame: Frame,
    responses: &mut Vec<(Token, Frame)>,
    outbox_cap_bytes: Option<usize>,
) {
    let targets: Vec<Token> = clients.keys().copied().filter(|t| *t != from).collect();
    for target in targets {
        deliver(clients, target, frame.clone(), responses, outbox_cap_bytes);
    }
    responses.push((from, ok()));
}

/// Pushes `frame` onto `target`'s outbox and, if `target` is parked in
/// `wait`, releases it right now with the queue depth response.
///
/// If `outbox_cap_bytes` is set and delivering this frame would push the
/// target over the cap, the target is closed instead of accepting unbounded
/// memory growth from a slow consumer (spec §5/§7 "resource errors").
fn deliver(
    clients: &mut ClientTable,
    target: Token,
    frame: Frame,
    responses: &mut Vec<(Token, Frame)>,
    outbox_cap_bytes: Option<usize>,
) {
    let Some(client) = clients.get_mut(&target) else { return };
    if client.state.closed {
        return;
    }
    client.state.push_outbox(frame);
    if let Some(cap) = outbox_cap_bytes
        && client.state.outbox_bytes() > cap
    {
        client.state.closed = true;
        responses.push((target, backpressure_error()));
        return;
    }
    if client.state.waiting {
        client.state.waiting = false;
        let depth = client.state.outbox.len();
        responses.push((target, wait_response(depth)));
    }
}

/// Drains up to `n` frames (or everything, if `n` is negative) from the
/// sender's own outbox, each echoed back verbatim, followed by one
/// terminator frame.
fn handle_sync(clients: &mut ClientTable, from: Token, frame: &Frame, responses: &mut Vec<(Token, Frame)>) {
    let Some(client) = clients.get_mut(&from) else { return };
    let n = frame.header.get(field::N).and_then(Value::as_i64).unwrap_or(-1);
    let take = if n < 0 { client.state.outbox.len() } else { n as usize };

    for _ in 0..take {
        match client.state.pop_outbox() {
            Some(drained) => responses.push((from, drained)),
            None => break,
        }
    }
    responses.push((from, ok()));
}

/// Responds immediately if the sender's outbox already holds something;
/// otherwise parks the connection. Released later from [`deliver`], not
/// from here.
fn handle_wait(clients: &mut ClientTable, from: Token, responses: &mut Vec<(Token, Frame)>) {
    let Some(client) = clients.get_mut(&from) else { return };
    if client.state.outbox.is_empty() {
        client.state.waiting = true;
    } else {
        responses.push((from, wait_response(client.state.outbox.len())));
    }
}

fn handle_devices(groups: &GroupRegistry, from: Token, responses: &mut Vec<(Token, Frame)>) {
    let devices = groups.list_nonempty();
    responses.push((
        from,
        ok_with(|h| {
            h.insert(field::DEVICES.to_owned(), Value::from(devices));
        }),
    ));
}

fn names_from_header(header: &Header) -> Vec<String> {
    match header.get(field::NAME) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect(),
        _ => Vec::new(),
    }
}

fn ok() -> Frame {
    ok_with(|_| {})
}

fn ok_with(fill: impl FnOnce(&mut Header)) -> Frame {
    let mut header = Header::new();
    header.insert(field::STATUS.to_owned(), Value::from(0));
    fill(&mut header);
    Frame::new(header, Bytes::new())
}

fn wait_response(depth: usize) -> Frame {
    ok_with(|h| {
        h.insert(field::N.to_owned(), Value::from(depth));
    })
}

fn protocol_error(message: impl Into<String>) -> Frame {
    let mut header = Header::new();
    header.insert(field::STATUS.to_owned(), Value::from(-1));
    header.insert(field::ERROR.to_owned(), Value::from(message.into()));
    Frame::new(header, Bytes::new())
}

fn backpressure_error() -> Frame {
    protocol_error("backpressure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, RawStream};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn fresh_client() -> Client {
        let (a, _b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let stream = mio::net::UnixStream::from_std(a);
        Client::new(Endpoint::new(RawStream::Unix(stream), "test".to_owned()))
    }

    fn frame(command: &str, fields: &[(&str, Value)]) -> Frame {
        let mut h = Header::new();
        h.insert(field::COMMAND.to_owned(), Value::from(command));
        for (k, v) in fields {
            h.insert((*k).to_owned(), v.clone());
        }
        Frame::new(h, Bytes::new())
    }

    #[test]
    fn send_skips_sender_and_delivers_to_other_members() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        let b = Token(2);
        clients.insert(a, fresh_client());
        clients.insert(b, fresh_client());
        groups.join(a, &mut clients.get_mut(&a).unwrap().state, ["g".to_owned()]);
        groups.join(b, &mut clients.get_mut(&b).unwrap().state, ["g".to_owned()]);

        let mut responses = Vec::new();
        let msg = frame("send", &[("name", Value::from("g")), ("varname", Value::from("x"))]);
        dispatch(&mut clients, &mut groups, a, msg, &mut responses, None);

        assert_eq!(clients[&a].state.outbox.len(), 0);
        assert_eq!(clients[&b].state.outbox.len(), 1);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, a);
    }

    #[test]
    fn send_to_empty_group_still_acks() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        clients.insert(a, fresh_client());

        let mut responses = Vec::new();
        let msg = frame("send", &[("name", Value::from("nobody-here"))]);
        dispatch(&mut clients, &mut groups, a, msg, &mut responses, None);

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.header.get("status").and_then(Value::as_i64), Some(0));
    }

    #[test]
    fn wait_parks_then_is_released_by_a_later_send() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        let b = Token(2);
        clients.insert(a, fresh_client());
        clients.insert(b, fresh_client());
        groups.join(a, &mut clients.get_mut(&a).unwrap().state, ["g".to_owned()]);
        groups.join(b, &mut clients.get_mut(&b).unwrap().state, ["g".to_owned()]);

        let mut responses = Vec::new();
        dispatch(&mut clients, &mut groups, b, frame("wait", &[]), &mut responses, None);
        assert!(responses.is_empty());
        assert!(clients[&b].state.waiting);

        let msg = frame("send", &[("name", Value::from("g"))]);
        dispatch(&mut clients, &mut groups, a, msg, &mut responses, None);

        assert!(!clients[&b].state.waiting);
        let wait_resp = responses.iter().find(|(t, _)| *t == b).expect("wait response");
        assert_eq!(wait_resp.1.header.get("n").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn sync_drains_bounded_then_remainder() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        clients.insert(a, fresh_client());
        for _ in 0..5 {
            clients.get_mut(&a).unwrap().state.push_outbox(Frame::empty());
        }

        let mut responses = Vec::new();
        dispatch(&mut clients, &mut groups, a, frame("sync", &[("n", Value::from(2))]), &mut responses, None);
        assert_eq!(responses.len(), 3); // 2 data frames + terminator
        assert_eq!(clients[&a].state.outbox.len(), 3);

        responses.clear();
        dispatch(&mut clients, &mut groups, a, frame("sync", &[("n", Value::from(-1))]), &mut responses, None);
        assert_eq!(responses.len(), 4); // remaining 3 + terminator
        assert_eq!(clients[&a].state.outbox.len(), 0);
    }

    #[test]
    fn devices_lists_only_nonempty_groups() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        let b = Token(2);
        clients.insert(a, fresh_client());
        clients.insert(b, fresh_client());
        groups.join(a, &mut clients.get_mut(&a).unwrap().state, ["a".to_owned(), "b".to_owned(), "c".to_owned()]);
        groups.join(b, &mut clients.get_mut(&b).unwrap().state, ["b".to_owned(), "c".to_owned(), "d".to_owned()]);
        groups.leave(b, &mut clients.get_mut(&b).unwrap().state, ["c".to_owned()]);

        let mut responses = Vec::new();
        dispatch(&mut clients, &mut groups, a, frame("devices", &[]), &mut responses, None);

        let devices = responses[0].1.header.get("devices").unwrap().as_array().unwrap();
        let mut names: Vec<&str> = devices.iter().map(|v| v.as_str().unwrap()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unknown_command_is_a_protocol_error_not_a_close() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        clients.insert(a, fresh_client());

        let mut responses = Vec::new();
        dispatch(&mut clients, &mut groups, a, frame("do-a-barrel-roll", &[]), &mut responses, None);
        assert_eq!(responses[0].1.header.get("status").and_then(Value::as_i64), Some(-1));
        assert!(responses[0].1.header.contains_key("error"));
    }

    #[test]
    fn outbox_cap_closes_the_slow_receiver_not_the_sender() {
        let mut clients = ClientTable::new();
        let mut groups = GroupRegistry::default();
        let a = Token(1);
        let b = Token(2);
        clients.insert(a, fresh_client());
        clients.insert(b, fresh_client());
        groups.join(a, &mut clients.get_mut(&a).unwrap().state, ["g".to_owned()]);
        groups.join(b, &mut clients.get_mut(&b).unwrap().state, ["g".to_owned()]);

        let mut responses = Vec::new();
        let msg = frame("send", &[("name", Value::from("g"))]);
        dispatch(&mut clients, &mut groups, a, msg, &mut responses, Some(16));

        assert!(clients[&b].state.closed);
        assert!(!clients[&a].state.closed);
        let backpressure = responses.iter().find(|(t, _)| *t == b).expect("backpressure response");
        assert_eq!(backpressure.1.header.get("status").and_then(Value::as_i64), Some(-1));
        assert_eq!(backpressure.1.header.get("error").and_then(Value::as_str), Some("backpressure"));
    }
}
