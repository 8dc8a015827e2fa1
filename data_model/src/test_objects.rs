pub mod tests {
    use crate::{FileId, FileRecord, FileRecordBuilder, FILE_ID_LEN};

    pub const TEST_FILE_NAME: &str = "report.pdf";

    pub fn mock_file_id(seed: u8) -> FileId {
        FileId::new(format!("{:02x}", seed).repeat(FILE_ID_LEN / 2))
    }

    pub fn mock_file_record(seed: u8, name: &str) -> FileRecord {
        FileRecordBuilder::default()
            .id(mock_file_id(seed))
            .original_name(name)
            .size(100)
            .created_at(1_700_000_000_000)
            .build()
            .unwrap()
    }
}
