//! Telegram bot commands: parsing and user-facing texts.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::core::{AdvanceOutcome, JoinOutcome, LeaveOutcome, MessageHandle, Queue, QueueId};
use crate::error::{Error, Result};

pub const USAGE_TEXT: &str = r#"QueueKing Commands:

/createqueue <name> [--time=<span>] [--date=<date>] - Create a queue
    span: 1.02:30, 02:30, 90m, 2h, 3d, 1w
    date: 2025-12-31 18:00 or 31.12.2025 18:00 (time optional)
    Without either the queue lives for a week.

/showallqueues - Point at every queue in this chat
/showmyqueues - List your queues (private chat only)
/expirequeue <id> - Delete a queue of this chat now
/usage - Show this help"#;

/// When a new queue should expire, as typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineSpec {
    /// Relative to the moment the command is handled
    After(chrono::Duration),
    /// Local wall-clock moment
    At(NaiveDateTime),
    /// Local date, at the current time of day
    On(NaiveDate),
}

impl DeadlineSpec {
    /// Absolute deadline relative to `now`.
    pub fn resolve(&self, now: DateTime<Local>) -> Result<DateTime<Utc>> {
        let local = match self {
            DeadlineSpec::After(span) => {
                return now
                    .with_timezone(&Utc)
                    .checked_add_signed(*span)
                    .ok_or_else(|| Error::InvalidArgument("time span is too long".to_string()));
            }
            DeadlineSpec::At(at) => *at,
            DeadlineSpec::On(date) => date.and_time(now.time()),
        };
        Local
            .from_local_datetime(&local)
            .earliest()
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| Error::InvalidArgument(format!("{} does not exist in local time", local)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotCommand {
    CreateQueue {
        name: String,
        deadline: Option<DeadlineSpec>,
    },
    ShowAllQueues,
    ShowMyQueues,
    ExpireQueue(QueueId),
    Usage,
    Unknown(String),
}

impl BotCommand {
    /// Parse a `/command args` message. Returns `Ok(None)` for plain text.
    pub fn parse(text: &str) -> Result<Option<BotCommand>> {
        let text = text.trim();
        if !text.starts_with('/') {
            return Ok(None);
        }

        let (head, args) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };
        // Group chats append the bot name: /createqueue@SomeBot
        let name = head[1..].split('@').next().unwrap_or("").to_lowercase();

        let command = match name.as_str() {
            "createqueue" => parse_create(args)?,
            "showallqueues" => BotCommand::ShowAllQueues,
            "showmyqueues" => BotCommand::ShowMyQueues,
            "expirequeue" => {
                let id = args
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Error::InvalidArgument("Usage: /expirequeue <id>".to_string()))?;
                let id = id
                    .parse::<QueueId>()
                    .map_err(|_| Error::InvalidArgument(format!("'{}' is not a queue id", id)))?;
                BotCommand::ExpireQueue(id)
            }
            "usage" | "help" | "start" => BotCommand::Usage,
            _ => BotCommand::Unknown(name),
        };
        Ok(Some(command))
    }
}

fn parse_create(args: &str) -> Result<BotCommand> {
    // Legacy form: everything after the last " -time:" / " -date:" is the value
    let padded = format!(" {}", args);
    for (marker, is_date) in [(" -time:", false), (" -date:", true)] {
        if let Some(idx) = padded.rfind(marker) {
            let name = padded[..idx].trim().to_string();
            let value = padded[idx + marker.len()..].trim();
            let deadline = if is_date { parse_date(value)? } else { parse_span(value)? };
            return Ok(BotCommand::CreateQueue {
                name,
                deadline: Some(deadline),
            });
        }
    }

    let tokens: Vec<&str> = args.split_whitespace().collect();
    let name_len = tokens.iter().take_while(|t| !t.starts_with("--")).count();
    let name = tokens[..name_len].join(" ");

    let mut deadline = None;
    let mut rest = tokens[name_len..].iter().peekable();
    while let Some(token) = rest.next() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("Expected --key=value, got '{}'", token)))?;
        match key {
            "--time" => deadline = Some(parse_span(value)?),
            "--date" => {
                // The time of day may follow as its own word
                let mut value = value.to_string();
                if let Some(time) = rest.next_if(|t| !t.starts_with("--")) {
                    value.push(' ');
                    value.push_str(time);
                }
                deadline = Some(parse_date(&value)?);
            }
            other => {
                return Err(Error::InvalidArgument(format!("Unknown option '{}'", other)));
            }
        }
    }

    Ok(BotCommand::CreateQueue { name, deadline })
}

/// `[d.]hh:mm[:ss]` or `<n>[smhdw]`.
pub fn parse_span(value: &str) -> Result<DeadlineSpec> {
    let value = value.trim();
    let invalid = || Error::InvalidArgument(format!("'{}' is not a valid time span", value));
    let number = |s: Option<regex::Match<'_>>| -> Result<i64> {
        match s {
            Some(m) => m.as_str().parse::<i64>().map_err(|_| invalid()),
            None => Ok(0),
        }
    };

    let clock = Regex::new(r"^(?:(\d+)\.)?(\d{1,2}):(\d{2})(?::(\d{2}))?$").ok();
    if let Some(caps) = clock.as_ref().and_then(|re| re.captures(value)) {
        let (days, hours, minutes, seconds) = (
            number(caps.get(1))?,
            number(caps.get(2))?,
            number(caps.get(3))?,
            number(caps.get(4))?,
        );
        if hours > 23 || minutes > 59 || seconds > 59 {
            return Err(invalid());
        }
        let total = days
            .checked_mul(86_400)
            .and_then(|d| d.checked_add(hours * 3_600 + minutes * 60 + seconds))
            .ok_or_else(invalid)?;
        return span_seconds(total).ok_or_else(invalid);
    }

    let unit = Regex::new(r"^(\d+)([smhdw])$").ok();
    if let Some(caps) = unit.as_ref().and_then(|re| re.captures(value)) {
        let amount = number(caps.get(1))?;
        let unit = match &caps[2] {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => 604_800,
        };
        let total = amount.checked_mul(unit).ok_or_else(invalid)?;
        return span_seconds(total).ok_or_else(invalid);
    }

    Err(invalid())
}

fn span_seconds(total: i64) -> Option<DeadlineSpec> {
    chrono::Duration::try_seconds(total).map(DeadlineSpec::After)
}

/// `YYYY-MM-DD[ HH:MM]` or `DD.MM.YYYY[ HH:MM]`, local time.
pub fn parse_date(value: &str) -> Result<DeadlineSpec> {
    let value = value.trim();
    for format in ["%Y-%m-%d %H:%M", "%d.%m.%Y %H:%M"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(DeadlineSpec::At(at));
        }
    }
    for format in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(DeadlineSpec::On(date));
        }
    }
    Err(Error::InvalidArgument(format!("'{}' is not a valid date", value)))
}

/// Public link to an announcement in a supergroup.
pub fn message_link(handle: MessageHandle) -> String {
    let chat = handle.chat_id.to_string();
    let chat = chat
        .strip_prefix("-100")
        .map(str::to_string)
        .unwrap_or_else(|| handle.chat_id.abs().to_string());
    format!("https://t.me/c/{}/{}", chat, handle.message_id)
}

/// One line of the /showmyqueues reply.
pub fn my_queue_line(queue: &Queue, rank: Option<usize>) -> String {
    let mut line = format!("Queue {}", queue.name);
    if let Some(rank) = rank {
        line.push_str(&format!(", you are #{}", rank));
    }
    if let Some(handle) = queue.announcement {
        line.push(' ');
        line.push_str(&message_link(handle));
    }
    line
}

pub fn join_toast(outcome: &JoinOutcome, queue_name: &str) -> String {
    match outcome {
        JoinOutcome::Joined(_) => format!("You entered queue {}", queue_name),
        JoinOutcome::AlreadyMember(_) => format!("You are already in queue {}", queue_name),
        JoinOutcome::QueueNotFound => QUEUE_GONE.to_string(),
    }
}

pub fn leave_toast(outcome: &LeaveOutcome, queue_name: &str) -> String {
    match outcome {
        LeaveOutcome::Left(_) => format!("You left queue {}", queue_name),
        LeaveOutcome::NotMember => format!("You are not in queue {}", queue_name),
        LeaveOutcome::QueueNotFound => QUEUE_GONE.to_string(),
    }
}

pub fn advance_toast(outcome: &AdvanceOutcome, queue_name: &str) -> String {
    match outcome {
        AdvanceOutcome::Advanced { successor, .. } => {
            format!("You let {} ahead", successor.display_name)
        }
        AdvanceOutcome::NotMember => format!("You are not in queue {}", queue_name),
        AdvanceOutcome::NoSuccessor => format!("Nobody to let ahead in queue {}", queue_name),
        AdvanceOutcome::QueueNotFound => QUEUE_GONE.to_string(),
    }
}

pub const QUEUE_GONE: &str = "This queue was deleted";
