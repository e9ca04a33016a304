use std::borrow::Cow;
use std::path::Path;

use regex::Regex;
use tracing::info;

use crate::error::StartupError;

/// Leading class index followed by whitespace, e.g. `"0 "` in `"0 4% 이하"`.
pub const DEFAULT_LABEL_PREFIX: &str = r"^\d+\s+";

/// Ordered class names; line `i` of the label file names class `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let text = std::fs::read_to_string(path).map_err(|source| StartupError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let labels =
            Self::parse(&text).ok_or_else(|| StartupError::EmptyLabels(path.to_path_buf()))?;
        info!(path = %path.display(), count = labels.len(), "labels loaded");
        Ok(labels)
    }

    /// Trims every line and drops trailing blank lines. `None` when nothing remains.
    pub fn parse(text: &str) -> Option<Self> {
        let mut labels: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
        while labels.last().is_some_and(|l| l.is_empty()) {
            labels.pop();
        }
        if labels.is_empty() {
            return None;
        }
        Some(Self { labels })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Strips the internal class-index prefix from a raw label.
#[derive(Clone, Debug)]
pub struct LabelNormalizer {
    prefix: Regex,
}

impl LabelNormalizer {
    pub fn new(pattern: &str) -> Result<Self, StartupError> {
        Ok(Self {
            prefix: Regex::new(pattern)?,
        })
    }

    pub fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        self.prefix.replace(raw, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn strips_index_prefix() {
        let normalizer = LabelNormalizer::new(DEFAULT_LABEL_PREFIX).unwrap();
        assert_eq!(normalizer.normalize("0 4% 이하"), "4% 이하");
        assert_eq!(normalizer.normalize("12\tover 30%"), "over 30%");
    }

    #[test]
    fn leaves_unprefixed_labels_alone() {
        let normalizer = LabelNormalizer::new(DEFAULT_LABEL_PREFIX).unwrap();
        assert_eq!(normalizer.normalize("4% 이하"), "4% 이하");
        assert_eq!(normalizer.normalize("10%"), "10%");
        assert_eq!(normalizer.normalize(""), "");
    }

    #[test]
    fn custom_pattern() {
        let normalizer = LabelNormalizer::new(r"^class_\d+:").unwrap();
        assert_eq!(normalizer.normalize("class_3:lean"), "lean");
        assert!(LabelNormalizer::new("(").is_err());
    }

    #[test]
    fn parse_trims_and_drops_trailing_blanks() {
        let labels = LabelSet::parse("0 a\r\n 1 b \n\n\n").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get(0), Some("0 a"));
        assert_eq!(labels.get(1), Some("1 b"));
        assert_eq!(labels.get(2), None);
        assert!(LabelSet::parse("\n \n").is_none());
    }

    #[test]
    fn load_reports_missing_and_empty_files() {
        let missing = LabelSet::load(Path::new("/definitely/not/here/labels.txt"));
        assert!(matches!(missing, Err(StartupError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file).unwrap();
        assert!(matches!(
            LabelSet::load(file.path()),
            Err(StartupError::EmptyLabels(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0 4% 이하\n1 5~9%\n").unwrap();
        assert_eq!(LabelSet::load(file.path()).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(
            index in 0u32..1000,
            text in "[a-zA-Z%가-힣][^\\n]{0,20}"
        ) {
            let normalizer = LabelNormalizer::new(DEFAULT_LABEL_PREFIX).unwrap();
            let raw = format!("{index} {text}");
            let once = normalizer.normalize(&raw).into_owned();
            prop_assert_eq!(&once, &text);
            prop_assert_eq!(normalizer.normalize(&once).into_owned(), once);
        }
    }
}
