//! Field-preserving merge for packaging descriptors.
//!
//! Generators always emit a placeholder version and homepage into the gemspec.
//! When the destination already carries a released version or a curated
//! homepage, the merge keeps the freshly generated file but swaps those
//! declaration lines back in, verbatim.

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]+gem\.version[ \t]*=[ \t]*"[\d.]+"$"#)
        .expect("version pattern is valid")
});

static HOMEPAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]+gem\.homepage[ \t]*=[ \t]*"[^"\n]+"$"#)
        .expect("homepage pattern is valid")
});

/// A descriptor field whose existing value survives regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeField {
    Version,
    Homepage,
}

impl MergeField {
    pub const ALL: [MergeField; 2] = [MergeField::Version, MergeField::Homepage];

    fn pattern(self) -> &'static Regex {
        match self {
            MergeField::Version => &VERSION_LINE,
            MergeField::Homepage => &HOMEPAGE_LINE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeField::Version => "version",
            MergeField::Homepage => "homepage",
        }
    }
}

impl fmt::Display for MergeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a merge: the content to write and which fields were carried over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub content: String,
    pub preserved: Vec<MergeField>,
}

/// Merge function that preserves a fixed set of declaration lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMerge {
    fields: BTreeSet<MergeField>,
}

impl FieldMerge {
    pub fn new(fields: impl IntoIterator<Item = MergeField>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// The version and homepage merge used for gemspecs.
    pub fn gemspec() -> Self {
        Self::new(MergeField::ALL)
    }

    pub fn fields(&self) -> &BTreeSet<MergeField> {
        &self.fields
    }

    /// Combine freshly generated content with the current destination content.
    ///
    /// For each field, the first declaration line found in `existing` replaces
    /// the first declaration line in `generated`. Fields absent from either
    /// side are left as generated. With no existing content the generated
    /// content is returned untouched.
    pub fn merge(&self, generated: &str, existing: Option<&str>) -> Merged {
        let mut content = generated.to_string();
        let mut preserved = Vec::new();

        let Some(existing) = existing else {
            return Merged { content, preserved };
        };

        for field in &self.fields {
            let pattern = field.pattern();
            let Some(found) = pattern.find(existing) else {
                continue;
            };
            if !pattern.is_match(&content) {
                continue;
            }
            content = pattern
                .replacen(&content, 1, NoExpand(found.as_str()))
                .into_owned();
            preserved.push(*field);
        }

        Merged { content, preserved }
    }
}
