use crate::error::AppError;

/// Byte layout of a chunked upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

impl ChunkLayout {
    /// Check a declared layout. Every chunk but the last holds exactly `chunk_size`
    /// bytes and no chunk may be empty, except the single chunk of an empty file.
    pub fn new(total_size: u64, chunk_count: u32, chunk_size: Option<u64>) -> Result<Self, AppError> {
        if chunk_count == 0 {
            return Err(AppError::Validation("chunk_count must be at least 1".into()));
        }

        if total_size == 0 {
            if chunk_count != 1 {
                return Err(AppError::Validation(
                    "An empty file is uploaded as a single empty chunk".into(),
                ));
            }
            return Ok(Self {
                total_size,
                chunk_size: chunk_size.unwrap_or(0),
                chunk_count,
            });
        }

        let chunk_size = match chunk_size {
            Some(0) => return Err(AppError::Validation("chunk_size must be positive".into())),
            Some(size) if size > total_size => {
                return Err(AppError::Validation(format!(
                    "chunk_size {size} exceeds total_size {total_size}"
                )));
            }
            Some(size) => size,
            None => total_size.div_ceil(u64::from(chunk_count)),
        };

        let full = u64::from(chunk_count - 1).checked_mul(chunk_size);
        match full {
            Some(full) if full < total_size && total_size - full <= chunk_size => {}
            _ => {
                return Err(AppError::Validation(format!(
                    "{chunk_count} chunks of {chunk_size} bytes cannot hold exactly {total_size} bytes"
                )));
            }
        }

        Ok(Self {
            total_size,
            chunk_size,
            chunk_count,
        })
    }

    /// Byte offset of chunk `index` within the file.
    pub fn offset(&self, index: u32) -> Result<u64, AppError> {
        u64::from(index)
            .checked_mul(self.chunk_size)
            .filter(|offset| *offset <= self.total_size)
            .ok_or_else(|| {
                AppError::Validation(format!("Chunk {index} lies beyond the end of the file"))
            })
    }

    /// Exact length chunk `index` must have.
    pub fn expected_length(&self, index: u32) -> Result<u64, AppError> {
        if index >= self.chunk_count {
            return Err(AppError::Validation(format!(
                "Chunk index {index} is out of range (0..{})",
                self.chunk_count
            )));
        }
        if index + 1 == self.chunk_count {
            Ok(self.total_size - self.offset(index)?)
        } else {
            Ok(self.chunk_size)
        }
    }
}
