//! Types for the asset index.

use serde::Serialize;

/// One indexed file. Scalars stay `None` until an extraction yields them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssetRecord {
    pub file_path: String,
    pub date_taken: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub shutter_speed: Option<String>,
    pub iso: Option<i64>,
    pub aperture: Option<f64>,
    pub focal_length: Option<f64>,
    pub metadata_json: Option<String>,
    pub created_at: Option<String>,
}

impl AssetRecord {
    /// True once every scalar attribute has a value.
    pub fn is_complete(&self) -> bool {
        self.date_taken.is_some()
            && self.camera_make.is_some()
            && self.camera_model.is_some()
            && self.lens.is_some()
            && self.shutter_speed.is_some()
            && self.iso.is_some()
            && self.aperture.is_some()
            && self.focal_length.is_some()
    }

    /// Whether upserting `incoming` over `self` would fill at least one empty field.
    pub fn would_fill(&self, incoming: &AssetRecord) -> bool {
        fn fills<T>(current: &Option<T>, new: &Option<T>) -> bool {
            current.is_none() && new.is_some()
        }
        fills(&self.date_taken, &incoming.date_taken)
            || fills(&self.camera_make, &incoming.camera_make)
            || fills(&self.camera_model, &incoming.camera_model)
            || fills(&self.lens, &incoming.lens)
            || fills(&self.shutter_speed, &incoming.shutter_speed)
            || fills(&self.iso, &incoming.iso)
            || fills(&self.aperture, &incoming.aperture)
            || fills(&self.focal_length, &incoming.focal_length)
            || fills(&self.metadata_json, &incoming.metadata_json)
    }
}

/// Outcome of a single asset upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> AssetRecord {
        AssetRecord {
            file_path: "/p/a.jpg".into(),
            date_taken: Some("2024-06-01T10:00:00".into()),
            camera_make: Some("FUJIFILM".into()),
            camera_model: Some("X-T5".into()),
            lens: Some("XF23mmF2 R WR".into()),
            shutter_speed: Some("1/250".into()),
            iso: Some(200),
            aperture: Some(2.8),
            focal_length: Some(23.0),
            metadata_json: Some("{}".into()),
            created_at: None,
        }
    }

    #[test]
    fn test_completeness() {
        let mut record = full();
        assert!(record.is_complete());
        record.lens = None;
        assert!(!record.is_complete());
    }

    #[test]
    fn test_would_fill_only_for_empty_fields() {
        let mut existing = full();
        existing.lens = None;

        let mut incoming = AssetRecord::default();
        incoming.camera_make = Some("Canon".into());
        assert!(!existing.would_fill(&incoming));

        incoming.lens = Some("RF 50mm".into());
        assert!(existing.would_fill(&incoming));
    }
}
