use std::fmt::Write;

use super::WindowRecord;

const HEADER: &str = "id,start_time,end_time,foot_count,accel_count,label";

/// Render windows as CSV. Raw readings are never included.
pub fn windows_to_csv(windows: &[WindowRecord]) -> String {
    let mut out = String::with_capacity(HEADER.len() + 1 + windows.len() * 64);
    out.push_str(HEADER);
    out.push('\n');
    for w in windows {
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "{},{},{},{},{},{}",
            esc(&w.id),
            w.start_time,
            w.end_time,
            w.foot_count,
            w.accel_count,
            esc(w.label.as_deref().unwrap_or(""))
        );
    }
    out
}

fn esc(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
