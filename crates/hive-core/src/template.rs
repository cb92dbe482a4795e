//! `{{key}}` template resolution against a run context.

use crate::decode::Context;

/// Resolve every `{{key}}` token in `template`.
///
/// Keys are trimmed and matched case-insensitively. Absent keys render as
/// `[missing: key]`. An unterminated `{{` is copied through.
pub fn resolve(template: &str, context: &Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        match context.get(&key.to_lowercase()) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("[missing: ");
                out.push_str(key);
                out.push(']');
            }
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}
