//! Layout of a chat message inside a pool block.
//!
//! ```text
//! [sent_at: u64 LE][sender_len: u32 LE][text_len: u32 LE][sender: 32 bytes][text]
//! ```

use crate::core::{MAX_MESSAGE_LENGTH, MAX_USERNAME_LENGTH};
use crate::errors::{Result, ShmcastError};
use crate::pool::{BlockHandle, BlockPool};

const SENT_AT_OFFSET: usize = 0;
const SENDER_LEN_OFFSET: usize = 8;
const TEXT_LEN_OFFSET: usize = 12;
const SENDER_OFFSET: usize = 16;
const TEXT_OFFSET: usize = SENDER_OFFSET + MAX_USERNAME_LENGTH;

pub const MESSAGE_HEADER_SIZE: usize = TEXT_OFFSET;

/// Longest text accepted by `send`, in bytes.
pub const MAX_TEXT_BYTES: usize = MAX_MESSAGE_LENGTH - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub sender: String,
    pub text: String,
    pub sent_at: u64,
}

pub fn validate_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(ShmcastError::EmptyMessage);
    }
    if text.len() > MAX_TEXT_BYTES {
        return Err(ShmcastError::MessageTooLong {
            len: text.len(),
            max: MAX_TEXT_BYTES,
        });
    }
    Ok(())
}

/// Encodes a message into a block the caller has allocated.
pub fn write(pool: &BlockPool, handle: BlockHandle, sender: &str, text: &str, sent_at: u64) -> Result<()> {
    validate_text(text)?;
    let sender = truncate(sender, MAX_USERNAME_LENGTH);
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    header[SENT_AT_OFFSET..SENDER_LEN_OFFSET].copy_from_slice(&sent_at.to_le_bytes());
    header[SENDER_LEN_OFFSET..TEXT_LEN_OFFSET].copy_from_slice(&(sender.len() as u32).to_le_bytes());
    header[TEXT_LEN_OFFSET..SENDER_OFFSET].copy_from_slice(&(text.len() as u32).to_le_bytes());
    header[SENDER_OFFSET..SENDER_OFFSET + sender.len()].copy_from_slice(sender.as_bytes());
    pool.copy_into_block(handle, 0, &header)?;
    pool.copy_into_block(handle, TEXT_OFFSET, text.as_bytes())
}

/// Decodes the message in `handle`. Lengths are clamped to the block, so a
/// corrupted header yields a shortened message rather than an out-of-bounds read.
pub fn read(pool: &BlockPool, handle: BlockHandle) -> Result<StoredMessage> {
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    pool.copy_from_block(handle, 0, &mut header)?;

    let sent_at = u64::from_le_bytes(field(&header, SENT_AT_OFFSET));
    let sender_len = (u32::from_le_bytes(field(&header, SENDER_LEN_OFFSET)) as usize).min(MAX_USERNAME_LENGTH);
    let max_text = MAX_MESSAGE_LENGTH.min(pool.block_size().saturating_sub(TEXT_OFFSET));
    let text_len = (u32::from_le_bytes(field(&header, TEXT_LEN_OFFSET)) as usize).min(max_text);

    let mut text = vec![0u8; text_len];
    pool.copy_from_block(handle, TEXT_OFFSET, &mut text)?;

    Ok(StoredMessage {
        sender: String::from_utf8_lossy(&header[SENDER_OFFSET..SENDER_OFFSET + sender_len]).into_owned(),
        text: String::from_utf8_lossy(&text).into_owned(),
        sent_at,
    })
}

fn field<const N: usize>(header: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&header[offset..offset + N]);
    bytes
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
