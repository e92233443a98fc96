use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Guarded sections in this crate never leave data half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shell-escape a string by wrapping it in single quotes.
///
/// Single quotes inside the string are handled by ending the single-quoted
/// segment, inserting an escaped single quote, and starting a new segment:
/// `it's` becomes `'it'\''s'`.
pub(crate) fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Render an argument vector as a copy-pasteable command line for logs.
///
/// Arguments made only of safe characters are left bare.
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        let safe = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@".contains(c));
        if safe {
            line.push_str(arg);
        } else {
            line.push_str(&shell_escape(arg));
        }
    }
    line
}
