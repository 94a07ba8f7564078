use std::sync::LazyLock;

use regex::Regex;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use domain::loadbalancer::failover::FailoverMode;

/// Prefix of the table owned by this application.
pub const TABLE_PREFIX: &str = "lobby";

/// The table name carries a fixed-width time suffix so that stale tables
/// from a crashed instance can be recognized by shape.
pub const TABLE_STAMP_WIDTH: usize = 14;

/// `HHMMSSDDMMYYYY`, always 14 digits.
static TABLE_STAMP: &[BorrowedFormatItem<'_>] =
    format_description!("[hour][minute][second][day][month][year]");

pub const PREROUTING_CHAIN: &str = "prerouting";
pub const POSTROUTING_CHAIN: &str = "postrouting";

/// Separator between an upstream group name and the failover mode id in
/// kernel object names.
const GROUP_MODE_SEPARATOR: &str = "-";

static TABLE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^{}-\\d{{{}}}$",
        regex::escape(TABLE_PREFIX),
        TABLE_STAMP_WIDTH
    ))
    .expect("table name pattern is valid")
});

/// A freshly stamped table name.
pub fn stamped_table_name(now: OffsetDateTime) -> String {
    let stamp = now.format(TABLE_STAMP).expect("table stamp format");
    format!("{TABLE_PREFIX}-{stamp}")
}

/// Whether a table name belongs to this application, current or stale.
pub fn is_owned_table_name(name: &str) -> bool {
    TABLE_NAME_RE.is_match(name)
}

/// Name of the chain and verdict map installed for an upstream group
/// under a failover mode.
pub fn group_object_name(group: &str, mode: FailoverMode) -> String {
    format!("{group}{GROUP_MODE_SEPARATOR}{}", mode.id())
}

/// Toggle a chain priority between its default and default+1. Called
/// during reconfiguration so the incoming table never shares a priority
/// with the outgoing one.
pub fn toggled_priority(current: i32, default: i32) -> i32 {
    if current == default { default + 1 } else { default }
}
