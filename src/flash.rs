//! One-shot status messages carried in the session cookie between a redirect
//! and the page that follows it.

use actix_session::Session;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

const FLASH_KEY: &str = "_flashes";
/// The session lives in a cookie, so only the newest messages are kept.
const MAX_PENDING: usize = 8;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FlashMessage {
    pub level: Level,
    pub message: String,
}

pub fn push(session: &Session, level: Level, message: impl Into<String>) -> Result<(), AppError> {
    let mut pending = session
        .get::<Vec<FlashMessage>>(FLASH_KEY)?
        .unwrap_or_default();
    pending.push(FlashMessage {
        level,
        message: message.into(),
    });
    if pending.len() > MAX_PENDING {
        pending.drain(..pending.len() - MAX_PENDING);
    }
    session.insert(FLASH_KEY, pending)?;
    Ok(())
}

pub fn success(session: &Session, message: impl Into<String>) -> Result<(), AppError> {
    push(session, Level::Success, message)
}

pub fn error(session: &Session, message: impl Into<String>) -> Result<(), AppError> {
    push(session, Level::Error, message)
}

/// Returns and clears every pending message.
pub fn take(session: &Session) -> Result<Vec<FlashMessage>, AppError> {
    let pending = session
        .get::<Vec<FlashMessage>>(FLASH_KEY)?
        .unwrap_or_default();
    if !pending.is_empty() {
        session.remove(FLASH_KEY);
    }
    Ok(pending)
}
