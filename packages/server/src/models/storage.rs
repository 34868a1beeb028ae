use serde::Serialize;

/// Logical versus physical usage of the archive.
#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct StorageStats {
    /// Live (not trashed) files.
    pub total_files: u64,
    /// Sum of live file sizes, as users see them.
    pub total_size: u64,
    pub total_folders: u64,
    pub trash_files: u64,
    pub trash_bytes: u64,
    /// Distinct blobs on disk.
    pub blob_count: u64,
    /// Bytes actually stored.
    pub physical_size: u64,
    /// `total_size + trash_bytes - physical_size`, never negative.
    pub saved_bytes: u64,
    /// `saved_bytes` as a percentage of the logical size.
    #[schema(example = 37.5)]
    pub saved_percent: f64,
    /// Logical bytes per physical byte, `1.0` for an empty archive.
    #[schema(example = 1.6)]
    pub dedup_ratio: f64,
}

impl StorageStats {
    /// Fill the derived fields from the raw counters.
    pub fn derive(mut self) -> Self {
        let logical = self.total_size + self.trash_bytes;
        self.saved_bytes = logical.saturating_sub(self.physical_size);
        self.saved_percent = if logical == 0 {
            0.0
        } else {
            round2(self.saved_bytes as f64 * 100.0 / logical as f64)
        };
        self.dedup_ratio = if self.physical_size == 0 {
            1.0
        } else {
            round2(logical as f64 / self.physical_size as f64)
        };
        self
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
