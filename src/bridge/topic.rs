use std::fmt;

use anyhow::{bail, Result};

const USER_PLACEHOLDER: &str = "{User}";
const ROOM_PLACEHOLDER: &str = "{Room}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    User,
    Room,
    /// `+`: exactly one level, ignored.
    Any,
    /// Trailing `#`: zero or more remaining levels.
    Rest,
}

/// A topic pattern with `{User}` / `{Room}` capture placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Raw (user, room) pair captured from a topic, before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Captures<'a> {
    pub user: &'a str,
    pub room: &'a str,
}

impl TopicPattern {
    /// Parses a pattern. The pattern must contain `{User}` and `{Room}`
    /// exactly once each; `#` is only valid as the final level.
    pub fn parse(pattern: &str) -> Result<Self> {
        let Some(raw) = normalize_topic(pattern) else {
            bail!("topic pattern is empty");
        };

        let levels: Vec<&str> = raw.split('/').collect();
        let mut segments = Vec::with_capacity(levels.len());
        let (mut users, mut rooms) = (0usize, 0usize);

        for (i, level) in levels.iter().enumerate() {
            let segment = match *level {
                USER_PLACEHOLDER => {
                    users += 1;
                    Segment::User
                }
                ROOM_PLACEHOLDER => {
                    rooms += 1;
                    Segment::Room
                }
                "+" => Segment::Any,
                "#" => {
                    if i + 1 != levels.len() {
                        bail!("topic pattern {raw}: '#' must be the last level");
                    }
                    Segment::Rest
                }
                other => {
                    if other.contains(['+', '#', '{', '}']) {
                        bail!("topic pattern {raw}: invalid level {other:?}");
                    }
                    Segment::Literal(other.to_string())
                }
            };
            segments.push(segment);
        }

        if users != 1 || rooms != 1 {
            bail!(
                "topic pattern {raw} must contain {USER_PLACEHOLDER} and {ROOM_PLACEHOLDER} \
                 exactly once"
            );
        }

        Ok(Self { raw, segments })
    }

    /// The normalized pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// MQTT subscription filter: placeholders become `+`.
    pub fn subscription(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::User | Segment::Room | Segment::Any => "+",
                Segment::Rest => "#",
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Matches a concrete topic and captures the user and room levels.
    /// A single leading `/` on the topic is tolerated.
    pub fn matches<'a>(&self, topic: &'a str) -> Option<Captures<'a>> {
        let topic = topic.strip_prefix('/').unwrap_or(topic);
        let mut levels = topic.split('/');
        let mut user = None;
        let mut room = None;

        for segment in &self.segments {
            match segment {
                Segment::Rest => {
                    return Some(Captures {
                        user: user?,
                        room: room?,
                    });
                }
                Segment::Literal(l) => {
                    if levels.next()? != l.as_str() {
                        return None;
                    }
                }
                Segment::Any => {
                    levels.next()?;
                }
                Segment::User => user = Some(non_empty(levels.next()?)?),
                Segment::Room => room = Some(non_empty(levels.next()?)?),
            }
        }

        if levels.next().is_some() {
            return None;
        }

        Some(Captures {
            user: user?,
            room: room?,
        })
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn non_empty(level: &str) -> Option<&str> {
    (!level.trim().is_empty()).then_some(level)
}

/// Trims the topic, drops leading and trailing `/`, and collapses repeated
/// separators. Returns `None` when nothing remains.
pub fn normalize_topic(topic: &str) -> Option<String> {
    let levels: Vec<&str> = topic
        .trim()
        .split('/')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if levels.is_empty() {
        None
    } else {
        Some(levels.join("/"))
    }
}
