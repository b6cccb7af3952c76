//! Shared UI icons.

use console::Emoji;

// Stage status
pub static IDLE: Emoji<'_, '_> = Emoji("⚪ ", "[ ]");
pub static WAITING: Emoji<'_, '_> = Emoji("⏳ ", "[.]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");

// Advisories
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "[i]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

// Work items
pub static ISSUE: Emoji<'_, '_> = Emoji("📝 ", "#");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "[D]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
