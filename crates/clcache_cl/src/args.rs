//! Command-line tokenization and response-file expansion.
//!
//! Implements the `cl.exe` tokenization rules (quotes and the backslash-
//! before-quote convention) for response-file contents and for the `CL` /
//! `_CL_` environment variables, and expands `@file` response files one
//! level deep.

use std::path::PathBuf;

use crate::error::AnalyzeError;

/// Splits command text into argv tokens using cl.exe quoting rules.
///
/// Backslashes are literal except when they precede a double quote: `2n`
/// backslashes plus a quote yield `n` backslashes and toggle quoting, while
/// `2n+1` backslashes plus a quote yield `n` backslashes and a literal quote.
pub fn split_command_text(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let mut argv = Vec::new();
    let mut token = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' {
            let mut n = 0;
            while i < chars.len() && chars[i] == '\\' {
                n += 1;
                i += 1;
            }
            let followed_by_quote = i < chars.len() && chars[i] == '"';
            if followed_by_quote {
                token.extend(std::iter::repeat('\\').take(n / 2));
                if n % 2 == 1 {
                    token.push('"');
                    i += 1;
                }
                // Even count: the quote is re-examined as a quoting character.
            } else {
                token.extend(std::iter::repeat('\\').take(n));
            }
            in_token = true;
            continue;
        }

        if quoted {
            if c == '"' {
                quoted = false;
            } else {
                token.push(c);
            }
        } else if c == '"' {
            quoted = true;
            in_token = true;
        } else if c.is_whitespace() {
            if in_token {
                argv.push(std::mem::take(&mut token));
                in_token = false;
            }
        } else {
            token.push(c);
            in_token = true;
        }
        i += 1;
    }

    if in_token {
        argv.push(token);
    }
    argv
}

/// Expands `@file` response-file arguments one level deep.
///
/// Files are decoded by BOM sniffing (UTF-16 LE/BE, UTF-8 with or without
/// BOM) and split with [`split_command_text`]. A response file whose
/// contents reference another response file is rejected.
pub fn expand_response_files(argv: &[String]) -> Result<Vec<String>, AnalyzeError> {
    let mut out = Vec::with_capacity(argv.len());
    for arg in argv {
        if arg.is_empty() {
            continue;
        }
        if let Some(file) = arg.strip_prefix('@') {
            let path = PathBuf::from(file);
            let raw = std::fs::read(&path).map_err(|source| AnalyzeError::ResponseFileIo {
                path: path.clone(),
                source,
            })?;
            let text = decode_response_file(&raw).ok_or_else(|| {
                AnalyzeError::ResponseFileEncoding { path: path.clone() }
            })?;
            for token in split_command_text(text.trim()) {
                if token.starts_with('@') {
                    return Err(AnalyzeError::NestedResponseFile { path });
                }
                out.push(token);
            }
        } else {
            out.push(arg.clone());
        }
    }
    Ok(out)
}

/// Prepends tokens from the `CL` variable and appends tokens from `_CL_`.
///
/// These are the documented cl.exe environment extension points; build
/// systems use them to inject switches without touching the command line.
pub fn extend_from_env(
    argv: Vec<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    let mut result = Vec::new();
    if let Some(prefix) = lookup("CL") {
        result.extend(split_command_text(prefix.trim()));
    }
    result.extend(argv);
    if let Some(postfix) = lookup("_CL_") {
        result.extend(split_command_text(postfix.trim()));
    }
    result
}

/// Decodes response-file bytes by BOM sniffing.
fn decode_response_file(raw: &[u8]) -> Option<String> {
    if let Some(body) = raw.strip_prefix(&[0xff, 0xfe]) {
        return decode_utf16(body, u16::from_le_bytes);
    }
    if let Some(body) = raw.strip_prefix(&[0xfe, 0xff]) {
        return decode_utf16(body, u16::from_be_bytes);
    }
    let body = raw.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(raw);
    String::from_utf8(body.to_vec()).ok()
}

fn decode_utf16(body: &[u8], combine: fn([u8; 2]) -> u16) -> Option<String> {
    if body.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| combine([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}
