use serde::{Deserialize, Serialize};

use super::TimeRange;

/// A timed event attached to the recording (marker, seizure onset, artifact...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Recording-time onset in seconds
    pub start: f64,
    pub duration: f64,
    pub label: String,
    /// Channels the annotation applies to; empty means all channels
    pub channels: Vec<usize>,
}

impl Annotation {
    pub fn new(start: f64, duration: f64, label: impl Into<String>) -> Self {
        Self {
            start,
            duration,
            label: label.into(),
            channels: Vec::new(),
        }
    }
}

/// Start-sorted annotation registry.
///
/// Annotations can be discovered in any chunk order, so additions append and
/// resort rather than assuming sorted input.
#[derive(Debug, Default)]
pub struct AnnotationRegistry {
    annotations: Vec<Annotation>,
}

impl AnnotationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, new: Vec<Annotation>) {
        if new.is_empty() {
            return;
        }
        // Skip exact duplicates re-reported by overlapping chunk reads
        for annotation in new {
            if !self.annotations.contains(&annotation) {
                self.annotations.push(annotation);
            }
        }
        self.annotations
            .sort_by(|a, b| a.start.total_cmp(&b.start));
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    pub fn all(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Annotations overlapping the given recording-time window
    pub fn in_range(&self, range: TimeRange) -> Vec<Annotation> {
        self.annotations
            .iter()
            .filter(|a| a.start < range.end && a.start + a.duration.max(0.0) >= range.start)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_sorts_on_add() {
        let mut registry = AnnotationRegistry::new();
        registry.add(vec![
            Annotation::new(5.0, 0.0, "b"),
            Annotation::new(1.0, 0.0, "a"),
        ]);
        registry.add(vec![Annotation::new(3.0, 1.0, "c")]);

        let labels: Vec<&str> = registry.all().iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_registry_range_query() {
        let mut registry = AnnotationRegistry::new();
        registry.add(vec![
            Annotation::new(1.0, 0.0, "a"),
            Annotation::new(4.0, 2.0, "b"),
            Annotation::new(9.0, 0.0, "c"),
        ]);

        let hits = registry.in_range(TimeRange::new(2.0, 7.0));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "b");
    }

    #[test]
    fn test_registry_deduplicates() {
        let mut registry = AnnotationRegistry::new();
        registry.add(vec![Annotation::new(1.0, 0.0, "a")]);
        registry.add(vec![Annotation::new(1.0, 0.0, "a")]);
        assert_eq!(registry.len(), 1);
    }
}
