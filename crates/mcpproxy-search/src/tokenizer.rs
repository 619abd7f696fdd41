//! Tokenizes tool name+description text on non-alphanumerics and on
//! camelCase/snake_case boundaries, per spec §4.4. This has no analogue
//! anywhere in the retrieval pack — it's new code, not adapted from a
//! teacher file.

/// Split `text` into lowercase tokens.
///
/// Pass 1: split on any run of non-alphanumeric characters (`_`, `-`, `.`,
/// whitespace, punctuation...).
/// Pass 2: within each alphanumeric run, further split at camelCase and
/// digit/letter boundaries (`fooBar` -> `foo`, `bar`; `v2Client` -> `v2`,
/// `client`).
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for run in text.split(|c: char| !c.is_alphanumeric()) {
        if run.is_empty() {
            continue;
        }
        tokens.extend(split_camel_and_digits(run));
    }
    tokens
}

fn split_camel_and_digits(run: &str) -> Vec<String> {
    let chars: Vec<char> = run.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        let boundary = i > 0 && {
            let prev = chars[i - 1];
            // lower->Upper (camelCase), letter<->digit transitions
            (prev.is_lowercase() && c.is_uppercase())
                || (prev.is_alphabetic() && c.is_numeric())
                || (prev.is_numeric() && c.is_alphabetic())
                // Acronym->Word boundary: "HTTPServer" -> "HTTP", "Server"
                || (i + 1 < chars.len()
                    && prev.is_uppercase()
                    && c.is_uppercase()
                    && chars[i + 1].is_lowercase())
        };
        if boundary && !current.is_empty() {
            out.push(std::mem::take(&mut current).to_lowercase());
        }
        current.push(c);
    }
    if !current.is_empty() {
        out.push(current.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation() {
        assert_eq!(tokenize("read_file.contents"), vec!["read", "file", "contents"]);
    }

    #[test]
    fn splits_camel_case() {
        assert_eq!(tokenize("listToolsForServer"), vec!["list", "tools", "for", "server"]);
    }

    #[test]
    fn splits_acronym_boundary() {
        assert_eq!(tokenize("HTTPServerInfo"), vec!["http", "server", "info"]);
    }

    #[test]
    fn splits_digit_letter_boundary() {
        assert_eq!(tokenize("v2Client"), vec!["v2", "client"]);
    }

    #[test]
    fn empty_text_yields_no_tokens() {
        assert!(tokenize("   ...  ").is_empty());
    }
}
