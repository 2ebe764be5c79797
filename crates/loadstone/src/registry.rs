//! Process-wide record of loaded features.

use std::collections::HashSet;
use std::sync::Mutex;

/// Maps module names onto their canonical feature spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureNormalizer {
    source_ext: String,
    compiled_ext: String,
    native_ext: String,
}

impl FeatureNormalizer {
    pub fn new(
        source_ext: impl Into<String>,
        compiled_ext: impl Into<String>,
        native_ext: impl Into<String>,
    ) -> Self {
        Self {
            source_ext: source_ext.into(),
            compiled_ext: compiled_ext.into(),
            native_ext: native_ext.into(),
        }
    }

    /// `a/b.lsc` -> `a/b.ls`, `a/b` -> `a/b.ls`; source and native names are kept.
    pub fn canonical(&self, name: &str) -> String {
        if let Some(stem) = name.strip_suffix(self.compiled_ext.as_str()) {
            return format!("{stem}{}", self.source_ext);
        }
        if name.ends_with(self.source_ext.as_str()) || name.ends_with(self.native_ext.as_str()) {
            return name.to_string();
        }
        format!("{name}{}", self.source_ext)
    }

    /// Spelling a native extension registers under: `a/b` -> `a/b.so`.
    pub fn native(&self, name: &str) -> String {
        if name.ends_with(self.native_ext.as_str()) {
            return name.to_string();
        }
        format!("{}{}", self.stem(name), self.native_ext)
    }

    /// `name` without any known suffix. Every spelling of one module shares it.
    pub fn stem<'a>(&self, name: &'a str) -> &'a str {
        [&self.compiled_ext, &self.source_ext, &self.native_ext]
            .into_iter()
            .find_map(|ext| name.strip_suffix(ext.as_str()))
            .unwrap_or(name)
    }

    /// Registered spellings that satisfy a require of `name`. A bare name is
    /// satisfied by either the source or the native form.
    fn satisfying(&self, name: &str) -> Vec<String> {
        let canonical = self.canonical(name);
        if self.stem(name) == name {
            vec![canonical, self.native(name)]
        } else {
            vec![canonical]
        }
    }
}

#[derive(Debug, Default)]
struct Features {
    order: Vec<String>,
    lookup: HashSet<String>,
}

/// Append-only set of canonical feature names.
///
/// Load order is observable through [`FeatureRegistry::snapshot`] and is
/// never reordered or compacted.
#[derive(Debug)]
pub struct FeatureRegistry {
    normalizer: FeatureNormalizer,
    inner: Mutex<Features>,
}

impl FeatureRegistry {
    pub fn new(normalizer: FeatureNormalizer) -> Self {
        Self {
            normalizer,
            inner: Mutex::new(Features::default()),
        }
    }

    pub fn normalizer(&self) -> &FeatureNormalizer {
        &self.normalizer
    }

    /// Returns true if `name` was not yet present.
    pub fn add(&self, name: &str) -> bool {
        let canonical = self.normalizer.canonical(name);
        let mut features = self.lock();
        if features.lookup.contains(&canonical) {
            return false;
        }
        features.lookup.insert(canonical.clone());
        features.order.push(canonical);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        let canonical = self.normalizer.canonical(name);
        self.lock().lookup.contains(&canonical)
    }

    /// True if a require of `name` has nothing left to do.
    pub fn provides(&self, name: &str) -> bool {
        let forms = self.normalizer.satisfying(name);
        let features = self.lock();
        forms.iter().any(|form| features.lookup.contains(form))
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        let mut features = self.lock();
        features.order.clear();
        features.lookup.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Features> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
