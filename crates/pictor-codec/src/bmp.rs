//! Streaming BMP decoder
//!
//! Uncompressed 24- and 32-bpp BITMAPINFOHEADER files. Rows are stored
//! bottom-up (unless the height is negative) and padded to 4 bytes;
//! each completed row is delivered at its final canvas line index, so
//! the sink sees lines arriving bottom-to-top for the common case.

use crate::{guard_size, DecodeError, DecodeSink, DisposalMethod, FrameDescriptor, StreamDecoder};
use pictor_raster::Rect;

#[derive(Debug)]
enum State {
    FileHeader,
    InfoHeader,
    /// Bytes between the parsed headers and the declared pixel offset
    Gap(usize),
    Rows,
    Done,
}

/// Incremental BMP decoder
pub struct BmpDecoder {
    state: State,
    width: u32,
    height: u32,
    bottom_up: bool,
    bits_per_pixel: u16,
    data_offset: usize,
    header_bytes: usize,
    row_bytes: usize,
    rows_emitted: u32,
    row_rgba: Vec<u8>,
    finished: bool,
}

impl BmpDecoder {
    pub fn new() -> Self {
        Self {
            state: State::FileHeader,
            width: 0,
            height: 0,
            bottom_up: true,
            bits_per_pixel: 0,
            data_offset: 0,
            header_bytes: 0,
            row_bytes: 0,
            rows_emitted: 0,
            row_rgba: Vec::new(),
            finished: false,
        }
    }

    /// Canvas line for the next decoded row
    fn current_line(&self) -> u32 {
        if self.bottom_up {
            self.height - 1 - self.rows_emitted
        } else {
            self.rows_emitted
        }
    }
}

impl Default for BmpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for BmpDecoder {
    fn decode_data(
        &mut self,
        data: &[u8],
        more: bool,
        sink: &mut dyn DecodeSink,
    ) -> Result<usize, DecodeError> {
        let mut pos = 0;
        loop {
            match self.state {
                State::FileHeader => {
                    if data.len() - pos < 14 {
                        break;
                    }
                    let d = &data[pos..];
                    if &d[0..2] != b"BM" {
                        return Err(DecodeError::Malformed("bad BMP signature".into()));
                    }
                    self.data_offset =
                        u32::from_le_bytes([d[10], d[11], d[12], d[13]]) as usize;
                    pos += 14;
                    self.header_bytes = 14;
                    self.state = State::InfoHeader;
                }
                State::InfoHeader => {
                    if data.len() - pos < 40 {
                        break;
                    }
                    let d = &data[pos..];
                    let info_size = u32::from_le_bytes([d[0], d[1], d[2], d[3]]) as usize;
                    if info_size < 40 {
                        return Err(DecodeError::Malformed("BMP info header too short".into()));
                    }
                    if data.len() - pos < info_size {
                        break;
                    }
                    let width = i32::from_le_bytes([d[4], d[5], d[6], d[7]]);
                    let height = i32::from_le_bytes([d[8], d[9], d[10], d[11]]);
                    let bits = u16::from_le_bytes([d[14], d[15]]);
                    let compression = u32::from_le_bytes([d[16], d[17], d[18], d[19]]);
                    if compression != 0 {
                        return Err(DecodeError::Malformed(format!(
                            "unsupported BMP compression {compression}"
                        )));
                    }
                    if bits != 24 && bits != 32 {
                        return Err(DecodeError::Malformed(format!(
                            "unsupported BMP bit depth {bits}"
                        )));
                    }
                    if width <= 0 || height == 0 {
                        return Err(DecodeError::Malformed("bad BMP dimensions".into()));
                    }
                    self.width = width as u32;
                    self.height = height.unsigned_abs();
                    self.bottom_up = height > 0;
                    self.bits_per_pixel = bits;
                    guard_size(self.width, self.height)?;
                    // Rows are padded to 4-byte boundaries
                    self.row_bytes =
                        ((self.bits_per_pixel as usize * self.width as usize + 31) / 32) * 4;
                    pos += info_size;
                    self.header_bytes += info_size;

                    if !sink.on_init_main_frame(self.width, self.height) {
                        return Err(DecodeError::Aborted);
                    }
                    sink.on_new_frame(&FrameDescriptor {
                        rect: Rect::of_size(self.width, self.height),
                        interlaced: false,
                        alpha: self.bits_per_pixel == 32,
                        transparent: false,
                        bits_per_pixel: 32,
                        disposal: DisposalMethod::None,
                        duration_cs: 0,
                        dont_blend_prev: false,
                        bottom_to_top: self.bottom_up,
                        palette: None,
                    });
                    let mut row = Vec::new();
                    row.try_reserve_exact(self.width as usize * 4)
                        .map_err(|_| DecodeError::OutOfMemory)?;
                    self.row_rgba = row;
                    self.state = State::Gap(self.data_offset.saturating_sub(self.header_bytes));
                }
                State::Gap(remaining) => {
                    let take = remaining.min(data.len() - pos);
                    pos += take;
                    if take < remaining {
                        self.state = State::Gap(remaining - take);
                        break;
                    }
                    self.state = State::Rows;
                }
                State::Rows => {
                    if data.len() - pos < self.row_bytes {
                        break;
                    }
                    let row = &data[pos..pos + self.row_bytes];
                    self.row_rgba.clear();
                    let bpp = self.bits_per_pixel as usize / 8;
                    for px in 0..self.width as usize {
                        let p = &row[px * bpp..px * bpp + bpp];
                        // BMP stores BGR(A)
                        let a = if bpp == 4 { p[3] } else { 255 };
                        self.row_rgba.extend_from_slice(&[p[2], p[1], p[0], a]);
                    }
                    let line = self.current_line();
                    sink.on_line_decoded(&self.row_rgba, line, 1);
                    pos += self.row_bytes;
                    self.rows_emitted += 1;
                    if self.rows_emitted == self.height {
                        self.state = State::Done;
                        self.finished = true;
                        sink.on_decoding_finished();
                    }
                }
                State::Done => break,
            }
        }
        if !self.finished && !more {
            return Err(DecodeError::Malformed("truncated BMP stream".into()));
        }
        // Trailing bytes after the last row are ignored
        if self.finished {
            return Ok(0);
        }
        Ok(data.len() - pos)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_sink::{feed_chunked, RecordingSink};

    /// Build a minimal bottom-up 24-bpp BMP, one pixel color per row.
    fn make_bmp(width: u32, rows: &[[u8; 3]]) -> Vec<u8> {
        let height = rows.len() as u32;
        let row_bytes = ((24 * width as usize + 31) / 32) * 4;
        let data_size = row_bytes * rows.len();
        let mut out = Vec::new();
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&((54 + data_size) as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&54u32.to_le_bytes());
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&(width as i32).to_le_bytes());
        out.extend_from_slice(&(height as i32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&24u16.to_le_bytes());
        out.extend_from_slice(&[0; 24]); // compression, sizes, colors
        for rgb in rows.iter().rev() {
            // stored bottom-up, BGR
            let mut row = Vec::new();
            for _ in 0..width {
                row.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]);
            }
            row.resize(row_bytes, 0);
            out.extend_from_slice(&row);
        }
        out
    }

    #[test]
    fn test_decode_two_rows() {
        let data = make_bmp(2, &[[255, 0, 0], [0, 255, 0]]);
        let mut sink = RecordingSink::default();
        let mut decoder = BmpDecoder::new();
        decoder.decode_data(&data, false, &mut sink).unwrap();
        assert_eq!(sink.canvas, Some((2, 2)));
        assert!(sink.frames[0].bottom_to_top);
        assert!(sink.finished);
        // Stored bottom-up: line 1 arrives first
        assert_eq!(sink.lines[0].0, 1);
        assert_eq!(sink.lines[1].0, 0);
        assert_eq!(&sink.lines[1].2[..4], &[255, 0, 0, 255]);
        assert_eq!(&sink.lines[0].2[..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_chunked_matches_whole() {
        let data = make_bmp(3, &[[1, 2, 3], [4, 5, 6], [7, 8, 9]]);
        let mut whole = RecordingSink::default();
        BmpDecoder::new().decode_data(&data, false, &mut whole).unwrap();
        for chunk in 1..8 {
            let mut sink = RecordingSink::default();
            let mut decoder = BmpDecoder::new();
            feed_chunked(&mut decoder, &data, chunk, &mut sink).unwrap();
            assert_eq!(sink.lines, whole.lines, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_truncated_is_malformed() {
        let data = make_bmp(2, &[[255, 0, 0], [0, 255, 0]]);
        let mut sink = RecordingSink::default();
        let mut decoder = BmpDecoder::new();
        let err = decoder.decode_data(&data[..data.len() - 3], false, &mut sink).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
