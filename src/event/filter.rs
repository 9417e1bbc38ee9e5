//! Composable event predicates.
//!
//! A [`Filter`] decides which events a subscription sees. Filters compose
//! with [`Filter::and`], [`Filter::or`] and [`Filter::not`]; the named
//! constructors cover the common subscriptions. Prefix-carrying
//! constructors accept up to 6 bytes and match when the given bytes are a
//! prefix of the event's key prefix.

use std::fmt;
use std::sync::Arc;

use crate::event::Event;
use crate::types::KeyPrefix;

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

enum Kind {
    Any,
    Ok,
    Error,
    Acknowledgement(Option<u32>),
    MessagesWaiting,
    NoMoreMessages,
    ContactMessage(Option<Vec<u8>>),
    ChannelMessage(Option<u8>),
    StatusResponse(Option<Vec<u8>>),
    Advertisement(Option<Vec<u8>>),
    PathUpdate(Option<Vec<u8>>),
    TelemetryResponse(Option<Vec<u8>>),
    ParseFailure,
    Custom(Predicate),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

/// A predicate over [`Event`]s.
pub struct Filter(Kind);

impl Filter {
    /// Matches every event.
    #[must_use]
    pub const fn any() -> Self {
        Self(Kind::Any)
    }

    /// Matches `Ok` responses.
    #[must_use]
    pub const fn ok() -> Self {
        Self(Kind::Ok)
    }

    /// Matches `Error` responses.
    #[must_use]
    pub const fn error() -> Self {
        Self(Kind::Error)
    }

    /// Matches any acknowledgement.
    #[must_use]
    pub const fn any_acknowledgement() -> Self {
        Self(Kind::Acknowledgement(None))
    }

    /// Matches the acknowledgement with the given code.
    #[must_use]
    pub const fn acknowledgement(code: u32) -> Self {
        Self(Kind::Acknowledgement(Some(code)))
    }

    /// Matches the messages-waiting push.
    #[must_use]
    pub const fn messages_waiting() -> Self {
        Self(Kind::MessagesWaiting)
    }

    /// Matches the no-more-messages response.
    #[must_use]
    pub const fn no_more_messages() -> Self {
        Self(Kind::NoMoreMessages)
    }

    /// Matches direct messages, optionally from a sender prefix.
    #[must_use]
    pub fn contact_message(from_prefix: Option<&[u8]>) -> Self {
        Self(Kind::ContactMessage(from_prefix.map(<[u8]>::to_vec)))
    }

    /// Matches channel messages, optionally on one channel.
    #[must_use]
    pub const fn channel_message(channel: Option<u8>) -> Self {
        Self(Kind::ChannelMessage(channel))
    }

    /// Matches remote status responses, optionally from a prefix.
    #[must_use]
    pub fn status_response(from_prefix: Option<&[u8]>) -> Self {
        Self(Kind::StatusResponse(from_prefix.map(<[u8]>::to_vec)))
    }

    /// Matches advertisements, optionally from a prefix.
    #[must_use]
    pub fn advertisement(from_prefix: Option<&[u8]>) -> Self {
        Self(Kind::Advertisement(from_prefix.map(<[u8]>::to_vec)))
    }

    /// Matches path updates, optionally for a prefix.
    #[must_use]
    pub fn path_update(for_prefix: Option<&[u8]>) -> Self {
        Self(Kind::PathUpdate(for_prefix.map(<[u8]>::to_vec)))
    }

    /// Matches telemetry responses, optionally from a prefix.
    #[must_use]
    pub fn telemetry_response(from_prefix: Option<&[u8]>) -> Self {
        Self(Kind::TelemetryResponse(from_prefix.map(<[u8]>::to_vec)))
    }

    /// Matches parse failures.
    #[must_use]
    pub const fn parse_failure() -> Self {
        Self(Kind::ParseFailure)
    }

    /// Matches events satisfying an arbitrary predicate.
    #[must_use]
    pub fn custom(matcher: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self(Kind::Custom(Arc::new(matcher)))
    }

    /// Both filters must match.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self(Kind::And(Box::new(self), Box::new(other)))
    }

    /// Either filter may match.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self(Kind::Or(Box::new(self), Box::new(other)))
    }

    /// Inverts this filter.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self(Kind::Not(Box::new(self)))
    }

    /// Whether the event passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        fn prefix_matches(wanted: Option<&Vec<u8>>, actual: Option<KeyPrefix>) -> bool {
            match wanted {
                None => true,
                Some(head) => actual.is_some_and(|p| p.starts_with(head)),
            }
        }

        match &self.0 {
            Kind::Any => true,
            Kind::Ok => matches!(event, Event::Ok { .. }),
            Kind::Error => matches!(event, Event::Error { .. }),
            Kind::Acknowledgement(code) => match event {
                Event::Acknowledgement(ack) => code.is_none_or(|c| ack.code_u32() == c),
                _ => false,
            },
            Kind::MessagesWaiting => matches!(event, Event::MessagesWaiting),
            Kind::NoMoreMessages => matches!(event, Event::NoMoreMessages),
            Kind::ContactMessage(prefix) => match event {
                Event::ContactMessage(msg) => {
                    prefix_matches(prefix.as_ref(), Some(msg.sender_prefix))
                }
                _ => false,
            },
            Kind::ChannelMessage(channel) => match event {
                Event::ChannelMessage(msg) => channel.is_none_or(|c| msg.channel_index == c),
                _ => false,
            },
            Kind::StatusResponse(prefix) => match event {
                Event::StatusResponse(status) => {
                    prefix_matches(prefix.as_ref(), Some(status.prefix))
                }
                _ => false,
            },
            Kind::Advertisement(prefix) => match event {
                Event::Advertisement { .. } | Event::NewAdvert(_) => {
                    prefix_matches(prefix.as_ref(), event.prefix())
                }
                _ => false,
            },
            Kind::PathUpdate(prefix) => match event {
                Event::PathUpdate { .. } => prefix_matches(prefix.as_ref(), event.prefix()),
                _ => false,
            },
            Kind::TelemetryResponse(prefix) => match event {
                Event::TelemetryResponse { .. } => prefix_matches(prefix.as_ref(), event.prefix()),
                _ => false,
            },
            Kind::ParseFailure => matches!(event, Event::ParseFailure { .. }),
            Kind::Custom(pred) => pred(event),
            Kind::And(a, b) => a.matches(event) && b.matches(event),
            Kind::Or(a, b) => a.matches(event) || b.matches(event),
            Kind::Not(inner) => !inner.matches(event),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.0 {
            Kind::Any => "any",
            Kind::Ok => "ok",
            Kind::Error => "error",
            Kind::Acknowledgement(_) => "acknowledgement",
            Kind::MessagesWaiting => "messages_waiting",
            Kind::NoMoreMessages => "no_more_messages",
            Kind::ContactMessage(_) => "contact_message",
            Kind::ChannelMessage(_) => "channel_message",
            Kind::StatusResponse(_) => "status_response",
            Kind::Advertisement(_) => "advertisement",
            Kind::PathUpdate(_) => "path_update",
            Kind::TelemetryResponse(_) => "telemetry_response",
            Kind::ParseFailure => "parse_failure",
            Kind::Custom(_) => "custom",
            Kind::And(..) => "and",
            Kind::Or(..) => "or",
            Kind::Not(_) => "not",
        };
        f.debug_tuple("Filter").field(&name).finish()
    }
}
