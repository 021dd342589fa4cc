use regex::{Regex, RegexBuilder};

/// Text filter applied to set labels.
///
/// Matches when the pattern occurs anywhere in the label. A pattern that
/// does not compile as a regex is matched literally.
#[derive(Debug, Clone)]
pub struct Filter {
    text: String,
    match_case: bool,
    is_regex: bool,
    pattern: Regex,
}

impl Filter {
    /// `None` for an empty `text`.
    pub fn new(text: &str, match_case: bool, is_regex: bool) -> Result<Option<Filter>, regex::Error> {
        if text.is_empty() {
            return Ok(None);
        }
        let pattern = if is_regex {
            match build(text, match_case) {
                Ok(pattern) => pattern,
                Err(e) => {
                    log::debug!("filter `{}` is not a valid regex, matching literally: {}", text, e);
                    build(&regex::escape(text), match_case)?
                }
            }
        } else {
            build(&regex::escape(text), match_case)?
        };
        Ok(Some(Filter {
            text: text.to_string(),
            match_case,
            is_regex,
            pattern,
        }))
    }

    /// Strict variant of [`Filter::new`] rejecting invalid regexes.
    pub fn regex(text: &str, match_case: bool) -> Result<Option<Filter>, regex::Error> {
        if text.is_empty() {
            return Ok(None);
        }
        let pattern = build(text, match_case)?;
        Ok(Some(Filter {
            text: text.to_string(),
            match_case,
            is_regex: true,
            pattern,
        }))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_match_case(&self) -> bool {
        self.match_case
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn matches(&self, label: &str) -> bool {
        self.pattern.is_match(label)
    }
}

fn build(source: &str, match_case: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(source)
        .case_insensitive(!match_case)
        .build()
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.match_case == other.match_case && self.is_regex == other.is_regex
    }
}

impl Eq for Filter {}
