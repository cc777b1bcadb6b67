//! Streaming GIF decoder
//!
//! Incremental decode of GIF87a/GIF89a streams: logical screen
//! descriptor, global and local color tables, graphic control
//! extensions (transparency, disposal, frame delay), the NETSCAPE loop
//! extension, interlaced frames, and LZW-compressed pixel data. Rows
//! are expanded through the active palette and delivered as 32-bpp
//! RGBA scanlines. Only complete syntactic units are consumed; a split
//! unit at the end of a chunk is reported back through the resend
//! count.

use crate::{guard_size, DecodeError, DecodeSink, DisposalMethod, FrameDescriptor, StreamDecoder};
use pictor_raster::{Palette, Rect};

const MAX_CODES: usize = 4096;
/// Extension payloads beyond this are skipped, not stored.
const MAX_EXTENSION_PAYLOAD: usize = 4096;

/// Parser position within the stream
#[derive(Debug)]
enum State {
    Header,
    ScreenDescriptor,
    GlobalColorTable(usize),
    BlockDispatch,
    ExtensionLabel,
    ExtensionBlocks { label: u8 },
    ImageDescriptor,
    LocalColorTable(usize),
    LzwMinCode,
    ImageData,
    Done,
}

/// Incremental GIF decoder
pub struct GifDecoder {
    state: State,
    canvas_width: u32,
    canvas_height: u32,
    global_palette: Option<Vec<[u8; 3]>>,
    extension_payload: Vec<u8>,
    pending_gce: Option<GraphicControl>,
    frame: Option<FrameState>,
    frame_index: u32,
    finished: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct GraphicControl {
    disposal: DisposalMethod,
    delay_cs: u32,
    transparent_index: Option<u8>,
}

/// Per-frame decode state: geometry, palette, LZW machine, row assembly
struct FrameState {
    rect: Rect,
    interlaced: bool,
    palette: Palette,
    local_palette: Option<Vec<[u8; 3]>>,
    transparent_index: Option<u8>,
    lzw: Lzw,
    row: Vec<u8>,
    row_pixels: u32,
    rows_emitted: u32,
}

impl GifDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            canvas_width: 0,
            canvas_height: 0,
            global_palette: None,
            extension_payload: Vec::new(),
            pending_gce: None,
            frame: None,
            frame_index: 0,
            finished: false,
        }
    }
}

impl Default for GifDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for GifDecoder {
    fn decode_data(
        &mut self,
        data: &[u8],
        more: bool,
        sink: &mut dyn DecodeSink,
    ) -> Result<usize, DecodeError> {
        let mut pos = 0;
        while !self.finished {
            match self.step(&data[pos..], sink)? {
                Consumed(0) => break,
                Consumed(n) => pos += n,
            }
        }
        if !self.finished && !more {
            // Lenient on a missing trailer, strict on a truncated
            // structure.
            if matches!(self.state, State::BlockDispatch) && pos == data.len() {
                self.state = State::Done;
                self.finished = true;
                sink.on_decoding_finished();
            } else {
                return Err(DecodeError::Malformed("truncated GIF stream".into()));
            }
        }
        Ok(data.len() - pos)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Bytes consumed by one parse step (0 = need more data)
struct Consumed(usize);

impl GifDecoder {
    /// Parse at most one syntactic unit from the front of `data`.
    fn step(&mut self, data: &[u8], sink: &mut dyn DecodeSink) -> Result<Consumed, DecodeError> {
        match self.state {
            State::Header => {
                if data.len() < 6 {
                    return Ok(Consumed(0));
                }
                if &data[..6] != b"GIF87a" && &data[..6] != b"GIF89a" {
                    return Err(DecodeError::Malformed("bad GIF signature".into()));
                }
                self.state = State::ScreenDescriptor;
                Ok(Consumed(6))
            }
            State::ScreenDescriptor => {
                if data.len() < 7 {
                    return Ok(Consumed(0));
                }
                let width = u16::from_le_bytes([data[0], data[1]]) as u32;
                let height = u16::from_le_bytes([data[2], data[3]]) as u32;
                guard_size(width, height)?;
                self.canvas_width = width;
                self.canvas_height = height;
                if !sink.on_init_main_frame(width, height) {
                    return Err(DecodeError::Aborted);
                }
                let flags = data[4];
                if flags & 0x80 != 0 {
                    let entries = 2usize << (flags & 0x07);
                    self.state = State::GlobalColorTable(entries * 3);
                } else {
                    self.state = State::BlockDispatch;
                }
                Ok(Consumed(7))
            }
            State::GlobalColorTable(len) => {
                if data.len() < len {
                    return Ok(Consumed(0));
                }
                self.global_palette = Some(read_color_table(&data[..len]));
                self.state = State::BlockDispatch;
                Ok(Consumed(len))
            }
            State::BlockDispatch => {
                if data.is_empty() {
                    return Ok(Consumed(0));
                }
                match data[0] {
                    0x21 => self.state = State::ExtensionLabel,
                    0x2C => self.state = State::ImageDescriptor,
                    0x3B => {
                        self.state = State::Done;
                        self.finished = true;
                        sink.on_decoding_finished();
                    }
                    other => {
                        return Err(DecodeError::Malformed(format!(
                            "unexpected GIF block 0x{other:02x}"
                        )));
                    }
                }
                Ok(Consumed(1))
            }
            State::ExtensionLabel => {
                if data.is_empty() {
                    return Ok(Consumed(0));
                }
                self.extension_payload.clear();
                self.state = State::ExtensionBlocks { label: data[0] };
                Ok(Consumed(1))
            }
            State::ExtensionBlocks { label } => {
                if data.is_empty() {
                    return Ok(Consumed(0));
                }
                let len = data[0] as usize;
                if len == 0 {
                    self.finish_extension(label, sink);
                    self.state = State::BlockDispatch;
                    return Ok(Consumed(1));
                }
                if data.len() < 1 + len {
                    return Ok(Consumed(0));
                }
                if self.extension_payload.len() < MAX_EXTENSION_PAYLOAD {
                    self.extension_payload.extend_from_slice(&data[1..1 + len]);
                }
                Ok(Consumed(1 + len))
            }
            State::ImageDescriptor => {
                if data.len() < 9 {
                    return Ok(Consumed(0));
                }
                let x = u16::from_le_bytes([data[0], data[1]]) as u32;
                let y = u16::from_le_bytes([data[2], data[3]]) as u32;
                let width = u16::from_le_bytes([data[4], data[5]]) as u32;
                let height = u16::from_le_bytes([data[6], data[7]]) as u32;
                guard_size(width, height)?;
                let flags = data[8];
                let gce = self.pending_gce.unwrap_or_default();
                self.frame = Some(FrameState {
                    rect: Rect::new(x, y, width, height),
                    interlaced: flags & 0x40 != 0,
                    palette: Palette::default(),
                    local_palette: None,
                    transparent_index: gce.transparent_index,
                    lzw: Lzw::new(),
                    row: Vec::new(),
                    row_pixels: 0,
                    rows_emitted: 0,
                });
                if flags & 0x80 != 0 {
                    let entries = 2usize << (flags & 0x07);
                    self.state = State::LocalColorTable(entries * 3);
                } else {
                    self.state = State::LzwMinCode;
                }
                Ok(Consumed(9))
            }
            State::LocalColorTable(len) => {
                if data.len() < len {
                    return Ok(Consumed(0));
                }
                let frame = self.frame.as_mut().ok_or_else(|| {
                    DecodeError::Malformed("color table outside a frame".into())
                })?;
                frame.local_palette = Some(read_color_table(&data[..len]));
                self.state = State::LzwMinCode;
                Ok(Consumed(len))
            }
            State::LzwMinCode => {
                if data.is_empty() {
                    return Ok(Consumed(0));
                }
                let min_code_size = data[0];
                if !(2..=8).contains(&min_code_size) {
                    return Err(DecodeError::Malformed(format!(
                        "bad LZW minimum code size {min_code_size}"
                    )));
                }
                self.begin_frame(min_code_size, sink)?;
                self.state = State::ImageData;
                Ok(Consumed(1))
            }
            State::ImageData => {
                if data.is_empty() {
                    return Ok(Consumed(0));
                }
                let len = data[0] as usize;
                if len == 0 {
                    // Block terminator: frame complete
                    self.frame = None;
                    self.pending_gce = None;
                    self.frame_index += 1;
                    self.state = State::BlockDispatch;
                    return Ok(Consumed(1));
                }
                if data.len() < 1 + len {
                    return Ok(Consumed(0));
                }
                self.feed_image_data(&data[1..1 + len], sink)?;
                Ok(Consumed(1 + len))
            }
            State::Done => Ok(Consumed(0)),
        }
    }

    /// Announce the frame to the sink and arm its LZW machine.
    fn begin_frame(&mut self, min_code_size: u8, sink: &mut dyn DecodeSink) -> Result<(), DecodeError> {
        let gce = self.pending_gce.unwrap_or_default();
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| DecodeError::Malformed("image data outside a frame".into()))?;
        let rgb = frame
            .local_palette
            .as_deref()
            .or(self.global_palette.as_deref())
            .ok_or_else(|| DecodeError::Malformed("GIF frame without a color table".into()))?;
        frame.palette = Palette::from_rgb(rgb, frame.transparent_index);
        frame.lzw.reset(min_code_size);
        let mut row = Vec::new();
        row.try_reserve_exact(frame.rect.width as usize * 4)
            .map_err(|_| DecodeError::OutOfMemory)?;
        frame.row = row;

        let descriptor = FrameDescriptor {
            rect: frame.rect,
            interlaced: frame.interlaced,
            alpha: false,
            transparent: frame.transparent_index.is_some(),
            bits_per_pixel: 32,
            disposal: gce.disposal,
            duration_cs: gce.delay_cs,
            dont_blend_prev: false,
            bottom_to_top: false,
            palette: None,
        };
        tracing::debug!(
            frame = self.frame_index,
            ?descriptor.rect,
            interlaced = descriptor.interlaced,
            "GIF frame boundary"
        );
        sink.on_new_frame(&descriptor);
        Ok(())
    }

    /// Run one LZW sub-block's payload through the machine and emit any
    /// rows it completes.
    fn feed_image_data(&mut self, payload: &[u8], sink: &mut dyn DecodeSink) -> Result<(), DecodeError> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| DecodeError::Malformed("image data outside a frame".into()))?;
        let total_pixels = frame.rect.width as u64 * frame.rect.height as u64;
        let mut indices = Vec::new();
        frame.lzw.feed(payload, &mut indices)?;
        for &index in &indices {
            let emitted = frame.rows_emitted as u64 * frame.rect.width as u64;
            if emitted + frame.row_pixels as u64 >= total_pixels {
                // Excess pixels beyond the declared frame are ignored
                break;
            }
            let color = frame.palette.color(index);
            frame.row.extend_from_slice(&color);
            frame.row_pixels += 1;
            if frame.row_pixels == frame.rect.width {
                let line = if frame.interlaced {
                    interlaced_line(frame.rows_emitted, frame.rect.height)
                } else {
                    frame.rows_emitted
                };
                sink.on_line_decoded(&frame.row, line, 1);
                frame.row.clear();
                frame.row_pixels = 0;
                frame.rows_emitted += 1;
            }
        }
        Ok(())
    }

    /// Process a completed extension's accumulated payload.
    fn finish_extension(&mut self, label: u8, sink: &mut dyn DecodeSink) {
        let payload = std::mem::take(&mut self.extension_payload);
        match label {
            // Graphic control extension
            0xF9 if payload.len() >= 4 => {
                let flags = payload[0];
                let disposal = match (flags >> 2) & 0x07 {
                    0 => DisposalMethod::None,
                    1 => DisposalMethod::DoNotDispose,
                    2 => DisposalMethod::RestoreBackground,
                    3 => DisposalMethod::RestorePrevious,
                    _ => DisposalMethod::DoNotDispose,
                };
                let delay_cs = u16::from_le_bytes([payload[1], payload[2]]) as u32;
                let transparent_index = (flags & 0x01 != 0).then_some(payload[3]);
                self.pending_gce = Some(GraphicControl { disposal, delay_cs, transparent_index });
            }
            // Application extension: NETSCAPE2.0 loop count
            0xFF if payload.len() >= 14 && &payload[..11] == b"NETSCAPE2.0" => {
                if payload[11] == 0x01 {
                    let loops = u16::from_le_bytes([payload[12], payload[13]]) as u32;
                    // 0 = loop forever; N = N extra iterations
                    let repeat = if loops == 0 { 0 } else { loops + 1 };
                    sink.on_animation_info(repeat);
                }
            }
            // Comment extension
            0xFE => {
                let text = String::from_utf8_lossy(&payload);
                sink.on_meta_data("comment", &text);
            }
            _ => {}
        }
    }
}

/// Map a sequential decode row to its canvas line for interlaced frames
fn interlaced_line(row: u32, height: u32) -> u32 {
    let mut n = row;
    for (start, step) in [(0u32, 8u32), (4, 8), (2, 4), (1, 2)] {
        if height > start {
            let count = (height - start).div_ceil(step);
            if n < count {
                return start + n * step;
            }
            n -= count;
        }
    }
    row
}

fn read_color_table(data: &[u8]) -> Vec<[u8; 3]> {
    data.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

/// GIF-flavored LZW decompressor, fed sub-block payloads as they arrive
struct Lzw {
    min_code_size: u8,
    code_size: u32,
    clear: u16,
    eoi: u16,
    next_code: u16,
    prefix: Vec<u16>,
    suffix: Vec<u8>,
    prev_code: Option<u16>,
    bit_buf: u32,
    bit_count: u32,
    ended: bool,
    scratch: Vec<u8>,
}

impl Lzw {
    fn new() -> Self {
        Self {
            min_code_size: 0,
            code_size: 0,
            clear: 0,
            eoi: 0,
            next_code: 0,
            prefix: vec![0; MAX_CODES],
            suffix: vec![0; MAX_CODES],
            prev_code: None,
            bit_buf: 0,
            bit_count: 0,
            ended: false,
            scratch: Vec::new(),
        }
    }

    fn reset(&mut self, min_code_size: u8) {
        self.min_code_size = min_code_size;
        self.clear = 1 << min_code_size;
        self.eoi = self.clear + 1;
        self.clear_table();
        self.prev_code = None;
        self.bit_buf = 0;
        self.bit_count = 0;
        self.ended = false;
        for code in 0..self.clear {
            self.suffix[code as usize] = code as u8;
        }
    }

    fn clear_table(&mut self) {
        self.next_code = self.eoi + 1;
        self.code_size = self.min_code_size as u32 + 1;
        self.prev_code = None;
    }

    /// Decode `payload` bits into pixel indices appended to `out`.
    fn feed(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), DecodeError> {
        if self.ended {
            return Ok(());
        }
        for &byte in payload {
            self.bit_buf |= (byte as u32) << self.bit_count;
            self.bit_count += 8;
            while self.bit_count >= self.code_size {
                let code = (self.bit_buf & ((1 << self.code_size) - 1)) as u16;
                self.bit_buf >>= self.code_size;
                self.bit_count -= self.code_size;
                if code == self.clear {
                    self.clear_table();
                    continue;
                }
                if code == self.eoi {
                    self.ended = true;
                    return Ok(());
                }
                self.decode_code(code, out)?;
            }
        }
        Ok(())
    }

    fn decode_code(&mut self, code: u16, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        self.scratch.clear();
        let expand_from;
        if code < self.next_code && code != self.clear && code != self.eoi {
            expand_from = code;
        } else if code == self.next_code {
            // KwKwK: the code being defined by this very step
            let prev = self
                .prev_code
                .ok_or_else(|| DecodeError::Malformed("LZW code before any literal".into()))?;
            self.scratch.push(self.first_byte(prev));
            expand_from = prev;
        } else {
            return Err(DecodeError::Malformed(format!("LZW code {code} out of range")));
        }

        // Walk the prefix chain (produces the string reversed)
        let mut cur = expand_from;
        loop {
            self.scratch.push(self.suffix[cur as usize]);
            if cur < self.clear {
                break;
            }
            cur = self.prefix[cur as usize];
        }
        out.extend(self.scratch.iter().rev());

        if let Some(prev) = self.prev_code {
            if (self.next_code as usize) < MAX_CODES {
                self.prefix[self.next_code as usize] = prev;
                self.suffix[self.next_code as usize] = *self.scratch.last().unwrap_or(&0);
                self.next_code += 1;
                if u32::from(self.next_code) == (1 << self.code_size) && self.code_size < 12 {
                    self.code_size += 1;
                }
            }
        }
        self.prev_code = Some(code);
        Ok(())
    }

    /// First byte of a code's expansion
    fn first_byte(&self, code: u16) -> u8 {
        let mut cur = code;
        while cur >= self.clear {
            cur = self.prefix[cur as usize];
        }
        self.suffix[cur as usize]
    }
}
