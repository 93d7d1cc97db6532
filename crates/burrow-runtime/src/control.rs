//! Encoding of the command handed to a container's init over the control
//! pipe.
//!
//! Arguments are joined with single spaces. A backslash or whitespace
//! character inside an argument is prefixed with a backslash, so commands
//! without such characters encode exactly as their space-joined form
//! (`["echo", "hi"]` is `echo hi`) while arguments containing spaces still
//! survive the trip. Empty arguments cannot be represented and are dropped.

/// Encodes an argument vector for the control pipe.
#[must_use]
pub fn encode(argv: &[String]) -> String {
    let mut out = String::new();
    for arg in argv.iter().filter(|a| !a.is_empty()) {
        if !out.is_empty() {
            out.push(' ');
        }
        for c in arg.chars() {
            if c == '\\' || c.is_ascii_whitespace() {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Decodes a control-pipe message back into an argument vector.
///
/// Unescaped runs of whitespace separate arguments; a trailing lone
/// backslash is kept literally.
#[must_use]
pub fn decode(message: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut chars = message.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next().unwrap_or('\\')),
            c if c.is_ascii_whitespace() => {
                if !current.is_empty() {
                    argv.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        argv.push(current);
    }
    argv
}
