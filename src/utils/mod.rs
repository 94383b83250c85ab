pub mod bins;
pub mod cancel;
pub mod process;

pub mod time {
    use std::sync::OnceLock;

    use time::{OffsetDateTime, UtcOffset, macros::format_description};

    static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

    /// Captures the local UTC offset. The lookup only succeeds while the
    /// process is single-threaded, so call this before spawning threads.
    pub fn init_local_offset() -> UtcOffset {
        *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
    }

    /// Local wall-clock time in the offset captured at startup; UTC when it
    /// was never captured or could not be determined.
    pub fn now() -> OffsetDateTime {
        let offset = LOCAL_OFFSET.get().copied().unwrap_or(UtcOffset::UTC);
        OffsetDateTime::now_utc().to_offset(offset)
    }

    /// vzdump's own timestamp layout, `YYYY_MM_DD-HH_MM_SS`.
    pub fn dump_stamp(t: OffsetDateTime) -> String {
        t.format(format_description!(
            "[year]_[month]_[day]-[hour]_[minute]_[second]"
        ))
            .unwrap_or_else(|_| t.unix_timestamp().to_string())
    }

}

pub mod path {
    #[inline]
    pub fn basename(s: &str) -> &str {
        s.rsplit('/').next().unwrap_or(s)
    }

}
