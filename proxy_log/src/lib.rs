use std::time::{SystemTime, UNIX_EPOCH};

pub fn format_time(now: SystemTime) -> String {
    let duration = now.duration_since(UNIX_EPOCH).unwrap();
    let secs = duration.as_secs();
    
    let year = 1970 + (secs / 31_557_600);  // Rough years
    let month = ((secs % 31_557_600) / 2_628_000) as u8 + 1;
    let day = ((secs % 2_628_000) / 86_400) as u8 + 1;
    let hour = ((secs % 86_400) / 3600) as u8;
    let minute = ((secs % 3600) / 60) as u8;
    let second = (secs % 60) as u8;
    
    format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", year, month, day, hour, minute, second)
}

#[macro_export]
macro_rules! log {
    ($level:expr, $color:expr, $($arg:tt)*) => {
        let ts = $crate::format_time(std::time::SystemTime::now());
        println!(
            "[{}] \x1b[30m #|| web-server ||# \x1b[0 \x1b[{}m{}\x1b[0m: {}",
            ts,
            $color,
            $level,
            format!($($arg)*)
        );
    };
}


#[macro_export]
macro_rules! info { ($($arg:tt)*) => { $crate::log!("INFO ", "32", $($arg)*); }; } // Green
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => { $crate::log!("WARN ", "33", $($arg)*); }; } // Yellow
#[macro_export]
macro_rules! errors { ($($arg:tt)*) => { $crate::log!("ERROR", "31", $($arg)*); }; } // Red
#[macro_export]
macro_rules! debug { ($($arg:tt)*) => { $crate::log!("DEBUG", "36", $($arg)*); }; } // Cyan
#[macro_export]
macro_rules! trace { ($($arg:tt)*) => { $crate::log!("TRACE", "34", $($arg)*); }; } // Blue

/// One structured record in a session's work log, batched and flushed together
/// rather than printed as it happens (mirrors how a session accumulates its
/// VSL records for the whole request before writing them out at `done`).
#[derive(Debug, Clone)]
pub struct WorkRecord {
    pub tag: &'static str,
    pub detail: String,
}

/// Per-session ring of log records. Call `flush` once, at the session's
/// terminating transition, instead of printing on every hook.
#[derive(Debug, Default)]
pub struct WorkerLog {
    xid: u64,
    records: Vec<WorkRecord>,
}

impl WorkerLog {
    pub fn new(xid: u64) -> Self {
        Self {
            xid,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, tag: &'static str, detail: impl Into<String>) {
        self.records.push(WorkRecord {
            tag,
            detail: detail.into(),
        });
    }

    /// Print every accumulated record for this session, tagged with its xid,
    /// then clear the ring so the next session starts clean.
    pub fn flush(&mut self) {
        for rec in &self.records {
            let ts = format_time(std::time::SystemTime::now());
            println!(
                "[{}] \x1b[30m #|| web-server ||# \x1b[0m\x1b[35m{:<8}\x1b[0m xid={} {}",
                ts, rec.tag, self.xid, rec.detail
            );
        }
        self.records.clear();
    }
}

#[macro_export]
macro_rules! wsp {
    ($log:expr, $tag:expr, $($arg:tt)*) => {
        $log.push($tag, format!($($arg)*));
    };
}