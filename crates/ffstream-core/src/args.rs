//! Argument string tokenizer.
//!
//! Clients send the ffmpeg command line as a single string, e.g.
//! `-i pipe:0 -vf 'scale=320:240' -f mp4 pipe:1`. This module turns it into
//! the argument vector handed to the process.
//!
//! The grammar is deliberately small:
//! - unquoted spaces separate tokens, and runs of spaces collapse;
//! - a single quote toggles quoted mode, in which spaces are literal;
//! - quote characters never appear in the output.
//!
//! There are no escapes and no double quotes. An unbalanced quote keeps
//! quoted mode on until the end of the input; tokenizing never fails.

/// Split a command-line string into an argument vector.
///
/// ```
/// use ffstream_core::tokenize;
///
/// assert_eq!(
///     tokenize("-vf 'scale=320:240' -y"),
///     vec!["-vf", "scale=320:240", "-y"],
/// );
/// ```
pub fn tokenize(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '\'' => quoted = !quoted,
            ' ' if quoted => current.push(c),
            ' ' => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_args() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn only_spaces_yields_no_args() {
        assert!(tokenize("    ").is_empty());
    }

    #[test]
    fn splits_on_spaces() {
        assert_eq!(tokenize("-f null -"), vec!["-f", "null", "-"]);
    }

    #[test]
    fn quoted_section_keeps_spaces() {
        assert_eq!(
            tokenize("-vf 'scale=320:240' -y"),
            vec!["-vf", "scale=320:240", "-y"]
        );
        assert_eq!(
            tokenize("-metadata 'title=My Movie' out.mp4"),
            vec!["-metadata", "title=My Movie", "out.mp4"]
        );
    }

    #[test]
    fn repeated_spaces_collapse() {
        assert_eq!(tokenize("  -i   pipe:0  "), vec!["-i", "pipe:0"]);
    }

    #[test]
    fn quotes_inside_token_are_dropped() {
        assert_eq!(tokenize("a'b c'd"), vec!["ab cd"]);
    }

    #[test]
    fn empty_quotes_produce_nothing() {
        assert_eq!(tokenize("'' -y"), vec!["-y"]);
    }

    #[test]
    fn unbalanced_quote_runs_to_end() {
        assert_eq!(tokenize("-vf 'scale=320:240 -y"), vec!["-vf", "scale=320:240 -y"]);
        assert!(tokenize("'").is_empty());
    }

    #[test]
    fn double_quotes_are_literal() {
        assert_eq!(tokenize("\"a b\""), vec!["\"a", "b\""]);
    }

    #[test]
    fn tabs_are_not_separators() {
        assert_eq!(tokenize("a\tb c"), vec!["a\tb", "c"]);
    }

    #[test]
    fn multibyte_characters_survive() {
        assert_eq!(tokenize("'héllo wörld' ✓"), vec!["héllo wörld", "✓"]);
    }
}
