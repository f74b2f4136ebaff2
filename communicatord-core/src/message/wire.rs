//! Single-line wire codec for `Message` (spec.md §4.2, §6).
//!
//! `[<from-server>:<from-service>' '][<server>:<service>'/']COMMAND[' '<name>=<value>[';'<name>=<value>…]]`
//!
//! Parameter values are URL-percent-escaped on the wire; characters outside
//! `[A-Za-z0-9._-]` are escaped, matching spec.md §4.2/§6.

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use super::{DestinationServer, DestinationService, Message};

/// Everything outside `[A-Za-z0-9._-]` gets percent-escaped.
const PARAM_VALUE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message line")]
    Empty,
    #[error("missing command")]
    MissingCommand,
    #[error("malformed parameter segment: {0}")]
    MalformedParameter(String),
}

pub fn serialize(msg: &Message) -> String {
    let mut out = String::new();

    if !msg.sent_from_server.is_empty() || !msg.sent_from_service.is_empty() {
        out.push_str(&msg.sent_from_server);
        out.push(':');
        out.push_str(&msg.sent_from_service);
        out.push(' ');
    }

    let dest_server = msg.destination_server.render();
    let dest_service = msg.destination_service.render();
    if !dest_server.is_empty() || !dest_service.is_empty() {
        out.push_str(dest_server);
        out.push(':');
        out.push_str(dest_service);
        out.push('/');
    }

    out.push_str(&msg.command);

    let mut first = true;
    for (name, value) in msg.parameters() {
        out.push(if first { ' ' } else { ';' });
        first = false;
        out.push_str(name);
        out.push('=');
        out.push_str(&percent_encode(value.as_bytes(), PARAM_VALUE_ESCAPE).to_string());
    }

    out
}

pub fn parse(line: &str) -> Result<Message, MessageError> {
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    if line.is_empty() {
        return Err(MessageError::Empty);
    }

    let (head, tail) = split_first_space(line);

    let (from_server, from_service, dest_command_token, params_raw) =
        if looks_like_from_prefix(head) {
            let (head2, tail2) = split_first_space(tail);
            if head2.is_empty() {
                return Err(MessageError::MissingCommand);
            }
            let (from_server, from_service) = split_colon(head);
            (from_server, from_service, head2, tail2)
        } else {
            (String::new(), String::new(), head, tail)
        };

    let (dest_server, dest_service, command) = split_dest_command(dest_command_token)?;
    if command.is_empty() {
        return Err(MessageError::MissingCommand);
    }

    let mut msg = Message::new(command)
        .with_destination(DestinationServer::parse(&dest_server), DestinationService::parse(&dest_service));
    msg.sent_from_server = from_server;
    msg.sent_from_service = from_service;

    if !params_raw.is_empty() {
        for segment in params_raw.split(';') {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) if !name.is_empty() => {
                    let decoded = percent_decode_str(value)
                        .decode_utf8()
                        .map_err(|_| MessageError::MalformedParameter(segment.to_string()))?;
                    msg.set_parameter(name.to_string(), decoded.into_owned());
                }
                _ => return Err(MessageError::MalformedParameter(segment.to_string())),
            }
        }
    }

    Ok(msg)
}

fn split_first_space(s: &str) -> (String, String) {
    match s.split_once(' ') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (s.to_string(), String::new()),
    }
}

fn looks_like_from_prefix(token: &str) -> bool {
    token.contains(':') && !token.contains('/')
}

fn split_colon(token: &str) -> (String, String) {
    match token.split_once(':') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (token.to_string(), String::new()),
    }
}

fn split_dest_command(token: String) -> Result<(String, String, String), MessageError> {
    match token.split_once('/') {
        Some((dest, command)) => {
            let (server, service) = split_colon(dest);
            Ok((server, service, command.to_string()))
        }
        None => Ok((String::new(), String::new(), token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationService;

    #[test]
    fn round_trips_bare_command() {
        let msg = Message::new("HELP");
        let wire = msg.to_wire();
        assert_eq!(wire, "HELP");
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trips_destination_and_params() {
        let msg = Message::new("PING")
            .with_destination(
                DestinationServer::Named("n1".into()),
                DestinationService::Named("alpha".into()),
            )
            .with_parameter("payload", "hi there")
            .with_parameter("cache", "ttl=30");
        let wire = msg.to_wire();
        assert_eq!(wire, "n1:alpha/PING payload=hi%20there;cache=ttl%3D30");
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(parsed.command, "PING");
        assert_eq!(parsed.parameter("payload"), Some("hi there"));
        assert_eq!(parsed.parameter("cache"), Some("ttl=30"));
    }

    #[test]
    fn round_trips_sent_from_and_destination() {
        let mut msg = Message::new("PING").with_destination(
            DestinationServer::Named("n1".into()),
            DestinationService::Named("alpha".into()),
        );
        msg.sent_from_server = "n2".into();
        msg.sent_from_service = "beta".into();
        let wire = msg.to_wire();
        assert_eq!(wire, "n2:beta n1:alpha/PING");
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(parsed.sent_from_server, "n2");
        assert_eq!(parsed.sent_from_service, "beta");
    }

    #[test]
    fn invariant_property_parse_of_serialize_is_identity() {
        let msg = Message::new("REGISTER")
            .with_parameter("service", "alpha")
            .with_parameter("version", "1");
        let reparsed = Message::parse(&msg.to_wire()).unwrap();
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn rejects_empty_line() {
        assert_eq!(Message::parse(""), Err(MessageError::Empty));
    }

    #[test]
    fn rejects_malformed_parameter() {
        assert!(matches!(
            Message::parse("HELP =novalue"),
            Err(MessageError::MalformedParameter(_))
        ));
    }
}
