use crate::domain::orchestration::TransferRequest;
use crate::error::{OrchestrationError, Result};
use std::io::Read;

/// Room-move requests, one per row under a `from_room,to_room` header.
///
/// Cells are trimmed. A row with the wrong number of cells comes out as an
/// error for that row only; the rows after it are still read.
pub struct TransferRequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransferRequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Rows are parsed as the iterator is advanced.
    pub fn requests(self) -> impl Iterator<Item = Result<TransferRequest>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(OrchestrationError::from))
    }
}
