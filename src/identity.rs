//! Package identifier rewriting
//!
//! A new identifier keeps the last segment of the old one and swaps the rest
//! for a random prefix: `com.studio.game` becomes `com.r123456.game`. The
//! manifest is then patched either by replacing every literal occurrence of
//! the old identifier (the default, which also catches authorities and
//! permissions derived from it) or by editing only the root `package`
//! attribute.
//!
//! Identifiers are only unique with high probability: suffixes are drawn
//! uniformly from `0..=max_suffix` and checked against the identifiers issued
//! by this rewriter, not against what is installed on the device. Two
//! independent sessions targeting the same last segment collide with
//! probability `1 / (max_suffix + 1)`.

use crate::error::{SideloadError, SideloadResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::Path;

/// Redraws allowed before accepting a colliding identifier
const MAX_ATTEMPTS: usize = 16;

/// Default identifier prefix; a random number is appended to it
pub const DEFAULT_PREFIX: &str = "com.r";

/// Default upper bound for the random suffix (inclusive)
pub const DEFAULT_MAX_SUFFIX: u32 = 999_999;

/// Old and new package identifier of one rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierToken {
    pub old: String,
    pub new: String,
}

/// How the manifest text is patched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteMode {
    /// Replace every occurrence of the old identifier
    #[default]
    Literal,
    /// Replace only the root element's `package` attribute
    Attribute,
}

/// Source of random identifier suffixes
pub trait RandomSource {
    /// Uniform value in `0..=max`
    fn next_suffix(&mut self, max: u32) -> u32;
}

/// Thread-local RNG from `rand`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_suffix(&mut self, max: u32) -> u32 {
        rand::thread_rng().gen_range(0..=max)
    }
}

/// Replays a fixed list of suffixes, cycling when exhausted
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<u32>,
    position: usize,
}

impl SequenceRandom {
    pub fn new(values: impl Into<Vec<u32>>) -> Self {
        Self {
            values: values.into(),
            position: 0,
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_suffix(&mut self, max: u32) -> u32 {
        if self.values.is_empty() {
            return 0;
        }
        let value = self.values[self.position % self.values.len()];
        self.position += 1;
        value.min(max)
    }
}

/// Build a new identifier from `old`, a prefix and a suffix
///
/// The last dot-separated segment of `old` is kept. Without a dot (or with
/// an empty trailing segment) the result is just `prefix + suffix`.
pub fn compute_new_identifier(old: &str, prefix: &str, suffix: u32) -> String {
    match old.rsplit_once('.') {
        Some((_, last)) if !last.is_empty() => format!("{}{}.{}", prefix, suffix, last),
        _ => format!("{}{}", prefix, suffix),
    }
}

/// Replace every literal occurrence of `old` in `text`
pub fn patch(text: &str, old: &str, new: &str) -> String {
    if old.is_empty() {
        return text.to_string();
    }
    text.replace(old, new)
}

/// Replace the root element's `package` attribute, leaving the rest of the text alone
///
/// The root start tag is re-emitted with the new value; comments or other
/// elements that mention the old identifier are not touched.
pub fn patch_attribute(text: &str, old: &str, new: &str) -> SideloadResult<String> {
    let root = RootTag::find(text)?;
    if root.package()?.as_deref() != Some(old) {
        return Err(SideloadError::InvalidManifest(format!(
            "root package attribute is not \"{}\"",
            old
        )));
    }

    let mut patched = root.start.to_owned();
    patched.clear_attributes();
    for attr in root.start.attributes() {
        let attr = attr.map_err(invalid)?;
        if attr.key.as_ref() == b"package" {
            patched.push_attribute(("package", new));
        } else {
            patched.push_attribute(attr);
        }
    }

    let event = if root.empty {
        Event::Empty(patched)
    } else {
        Event::Start(patched)
    };
    let mut writer = Writer::new(Vec::new());
    writer.write_event(event).map_err(invalid)?;
    let tag = String::from_utf8(writer.into_inner()).map_err(invalid)?;

    let mut out = String::with_capacity(text.len() + new.len());
    out.push_str(&text[..root.span.start]);
    out.push_str(&tag);
    out.push_str(&text[root.span.end..]);
    Ok(out)
}

fn invalid(e: impl std::fmt::Display) -> SideloadError {
    SideloadError::InvalidManifest(e.to_string())
}

/// Root element start tag and its byte range in the document
struct RootTag<'a> {
    start: BytesStart<'a>,
    span: Range<usize>,
    /// Self-closing `<manifest ... />`
    empty: bool,
}

impl<'a> RootTag<'a> {
    fn find(text: &'a str) -> SideloadResult<Self> {
        let mut reader = Reader::from_str(text);

        loop {
            let (start, empty) = match reader.read_event().map_err(invalid)? {
                Event::Start(start) => (start, false),
                Event::Empty(start) => (start, true),
                Event::Eof => {
                    return Err(SideloadError::InvalidManifest(
                        "document has no root element".to_string(),
                    ))
                }
                _ => continue,
            };

            // Attribute values cannot contain a raw `<`, so the last one
            // before the reader position opens this tag.
            let end = usize::try_from(reader.buffer_position()).map_err(invalid)?;
            let begin = text
                .get(..end)
                .and_then(|head| head.rfind('<'))
                .ok_or_else(|| invalid("cannot locate root start tag"))?;

            return Ok(Self {
                start,
                span: begin..end,
                empty,
            });
        }
    }

    /// Unescaped, non-empty `package` value
    fn package(&self) -> SideloadResult<Option<String>> {
        for attr in self.start.attributes() {
            let attr = attr.map_err(invalid)?;
            if attr.key.as_ref() == b"package" {
                let value = attr.unescape_value().map_err(invalid)?;
                return Ok(Some(value.into_owned()).filter(|v| !v.is_empty()));
            }
        }
        Ok(None)
    }
}

/// Raw manifest text plus its declared package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDocument {
    pub text: String,
    pub package: String,
}

impl ManifestDocument {
    /// Read and parse a manifest file
    pub fn load(path: impl AsRef<Path>) -> SideloadResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SideloadError::ManifestNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        Self::parse(text)
    }

    /// Parse manifest text, extracting the root `package` attribute
    pub fn parse(text: impl Into<String>) -> SideloadResult<Self> {
        let text = text.into();
        let package = read_package_attribute(&text)?;
        Ok(Self { text, package })
    }

    /// Patched text for `new` in the given mode
    pub fn patched(&self, new: &str, mode: RewriteMode) -> SideloadResult<String> {
        match mode {
            RewriteMode::Literal => Ok(patch(&self.text, &self.package, new)),
            RewriteMode::Attribute => patch_attribute(&self.text, &self.package, new),
        }
    }
}

fn read_package_attribute(text: &str) -> SideloadResult<String> {
    RootTag::find(text)?.package()?.ok_or_else(|| {
        SideloadError::InvalidManifest("root element has no package attribute".to_string())
    })
}

/// Generates identifiers and rewrites manifests
pub struct IdentityRewriter {
    prefix: String,
    max_suffix: u32,
    mode: RewriteMode,
    random: Box<dyn RandomSource + Send>,
    /// Identifiers handed out by this rewriter
    issued: HashSet<String>,
}

impl IdentityRewriter {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_suffix: DEFAULT_MAX_SUFFIX,
            mode: RewriteMode::default(),
            random: Box::new(ThreadRandom),
            issued: HashSet::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_suffix(mut self, max_suffix: u32) -> Self {
        self.max_suffix = max_suffix;
        self
    }

    pub fn with_mode(mut self, mode: RewriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_random(mut self, random: impl RandomSource + Send + 'static) -> Self {
        self.random = Box::new(random);
        self
    }

    pub fn mode(&self) -> RewriteMode {
        self.mode
    }

    /// Identifiers issued so far
    pub fn issued(&self) -> &HashSet<String> {
        &self.issued
    }

    /// Draw a fresh identifier for `old`
    ///
    /// An identifier already issued by this rewriter is never returned
    /// again. Candidates containing `old` are redrawn a bounded number of
    /// times, after which the first unissued candidate is accepted. Fails
    /// when every draw was already issued.
    pub fn new_identifier(&mut self, old: &str) -> SideloadResult<String> {
        let mut fallback: Option<String> = None;
        for attempt in 0..MAX_ATTEMPTS {
            let suffix = self.random.next_suffix(self.max_suffix);
            let candidate = compute_new_identifier(old, &self.prefix, suffix);
            if self.issued.contains(&candidate) {
                tracing::debug!(
                    target: "sideload::identity",
                    candidate = %candidate,
                    attempt,
                    "Identifier already issued, redrawing"
                );
                continue;
            }
            if !candidate.contains(old) {
                self.issued.insert(candidate.clone());
                return Ok(candidate);
            }
            tracing::debug!(
                target: "sideload::identity",
                candidate = %candidate,
                attempt,
                "Identifier contains the old one, redrawing"
            );
            fallback.get_or_insert(candidate);
        }

        let candidate = fallback.ok_or_else(|| {
            SideloadError::Config(format!(
                "no unused identifier for {} after {} draws; raise identity.max_suffix",
                old, MAX_ATTEMPTS
            ))
        })?;
        tracing::warn!(
            target: "sideload::identity",
            candidate = %candidate,
            "Accepting identifier that contains {}", old
        );
        self.issued.insert(candidate.clone());
        Ok(candidate)
    }

    /// Rewrite the manifest at `path` in place
    pub fn rewrite(&mut self, path: &Path) -> SideloadResult<IdentifierToken> {
        let document = ManifestDocument::load(path)?;
        let new = self.new_identifier(&document.package)?;
        let text = document.patched(&new, self.mode)?;
        fs::write(path, text)?;

        tracing::info!(
            target: "sideload::identity",
            old = %document.package,
            new = %new,
            mode = ?self.mode,
            "Rewrote package identifier"
        );

        Ok(IdentifierToken {
            old: document.package,
            new,
        })
    }
}

impl Default for IdentityRewriter {
    fn default() -> Self {
        Self::new()
    }
}
