//! URL pattern matching for configuration entries.
//!
//! Two flavours: glob patterns (`*` one path segment, `**` any number of
//! segments, `?` one non-separator character) matched against the full URL
//! with the service's base applied, and regexes matched as substrings
//! unless anchored. Query strings never participate in matching.

use regex::Regex;
use url::{Position, Url};

/// A not-yet-resolved configuration pattern.
#[derive(Clone, Debug)]
pub enum UrlPattern {
    Glob(String),
    Regex(Regex),
}

impl From<&str> for UrlPattern {
    fn from(glob: &str) -> Self {
        UrlPattern::Glob(glob.to_owned())
    }
}

impl From<String> for UrlPattern {
    fn from(glob: String) -> Self {
        UrlPattern::Glob(glob)
    }
}

impl From<Regex> for UrlPattern {
    fn from(regex: Regex) -> Self {
        UrlPattern::Regex(regex)
    }
}

impl UrlPattern {
    /// Resolve against a base URL and compile.
    ///
    /// Globs without a scheme are prefixed with the base; regexes are used
    /// as given.
    pub fn compile(&self, base: Option<&Url>) -> Result<CompiledPattern, regex::Error> {
        match self {
            UrlPattern::Regex(regex) => Ok(CompiledPattern {
                regex: regex.clone(),
                description: format!("regex {}", regex.as_str()),
            }),
            UrlPattern::Glob(glob) => {
                let resolved = match base {
                    Some(base) if !glob.contains("://") => {
                        let prefix = base.as_str().trim_end_matches('/');
                        format!("{}/{}", prefix, glob.trim_start_matches('/'))
                    }
                    _ => glob.clone(),
                };
                Ok(CompiledPattern {
                    regex: Regex::new(&glob_to_regex(&resolved))?,
                    description: glob.clone(),
                })
            }
        }
    }
}

/// A pattern frozen at registration time, ready to test URLs.
#[derive(Clone, Debug)]
pub struct CompiledPattern {
    regex: Regex,
    description: String,
}

impl CompiledPattern {
    /// Whether this pattern covers `url`. The query string is ignored.
    pub fn matches(&self, url: &Url) -> bool {
        self.regex.is_match(&url[..Position::AfterPath])
    }

    /// The pattern as written, for configuration logging.
    pub fn description(&self) -> &str {
        &self.description
    }
}

fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        // "/**" matches any number of segments, including none at all
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') && chars.get(i + 2) == Some(&'*') {
            out.push_str("(/.*)?");
            i += 3;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'*') {
            out.push_str(".*");
            i += 2;
        } else if chars[i] == '*' {
            out.push_str("[^/]*");
            i += 1;
        } else if chars[i] == '?' {
            out.push_str("[^/]");
            i += 1;
        } else {
            out.push_str(&regex::escape(&chars[i].to_string()));
            i += 1;
        }
    }
    out.push('$');
    out
}
