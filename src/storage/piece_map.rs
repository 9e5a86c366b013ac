use crate::metainfo::Info;

/// One contiguous slice of a file backing part of a piece or range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    /// Offset within the file.
    pub offset: u64,
    pub length: u64,
}

/// Maps piece indices and global byte ranges onto file slices.
///
/// Built once per torrent. For every piece `i` the spans cover exactly
/// `[i * piece_length, min((i + 1) * piece_length, total_length))` and
/// their lengths sum to `piece_len(i)`.
#[derive(Debug)]
pub struct PieceMap {
    /// `(offset, length)` per file, in payload order.
    files: Vec<(u64, u64)>,
    piece_length: u64,
    total_length: u64,
}

impl PieceMap {
    pub fn new(info: &Info) -> Self {
        Self {
            files: info.files.iter().map(|f| (f.offset, f.length)).collect(),
            piece_length: info.piece_length,
            total_length: info.total_length,
        }
    }

    /// File slices backing piece `index`, in order.
    pub fn piece_spans(&self, index: u32) -> Vec<FileSpan> {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        self.range_spans(begin, end - begin)
    }

    /// File slices backing `length` payload bytes starting at global
    /// offset `begin`, in order. Zero-length files produce no span.
    pub fn range_spans(&self, begin: u64, length: u64) -> Vec<FileSpan> {
        let end = (begin + length).min(self.total_length);
        let mut spans = Vec::new();

        for (file_index, &(offset, len)) in self.files.iter().enumerate() {
            let file_end = offset + len;
            if file_end <= begin || offset >= end || len == 0 {
                continue;
            }
            let span_begin = begin.max(offset);
            let span_end = end.min(file_end);
            spans.push(FileSpan {
                file_index,
                offset: span_begin - offset,
                length: span_end - span_begin,
            });
        }

        spans
    }
}
