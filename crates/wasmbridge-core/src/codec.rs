//! Batch serialization into and out of guest memory.
//!
//! Input events are written into fixed-stride slots; output records are read
//! as flat, undelimited windows sliced by a [`RecordLayout`]. Both directions
//! are pure functions of their arguments and the memory slice they are given.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::region::MemoryRegion;

/// Width of the `method` field in the default request layout.
pub const METHOD_WIDTH: u32 = 8;
/// Width of the `path` field in the default request layout.
pub const PATH_WIDTH: u32 = 120;

/// One named, fixed-width field of an output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub width: u32,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, width: u32) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }
}

/// Ordered field widths applied uniformly over each output window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldSpec>", into = "Vec<FieldSpec>")]
pub struct RecordLayout {
    fields: Vec<FieldSpec>,
}

impl RecordLayout {
    /// Build a layout. Fields must be non-empty, non-zero width, and uniquely
    /// named.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        if fields.is_empty() {
            return Err(BridgeError::Layout("layout has no fields".into()));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.width == 0 {
                return Err(BridgeError::Layout(format!(
                    "field `{}` has zero width",
                    field.name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(BridgeError::Layout(format!(
                    "duplicate field `{}`",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// `method` (8 bytes) followed by `path` (120 bytes).
    pub fn http_request() -> Self {
        Self {
            fields: vec![
                FieldSpec::new("method", METHOD_WIDTH),
                FieldSpec::new("path", PATH_WIDTH),
            ],
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Sum of all field widths.
    pub fn width(&self) -> u64 {
        self.fields.iter().map(|f| u64::from(f.width)).sum()
    }
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self::http_request()
    }
}

impl TryFrom<Vec<FieldSpec>> for RecordLayout {
    type Error = BridgeError;

    fn try_from(fields: Vec<FieldSpec>) -> Result<Self> {
        Self::new(fields)
    }
}

impl From<RecordLayout> for Vec<FieldSpec> {
    fn from(layout: RecordLayout) -> Self {
        layout.fields
    }
}

/// A decoded field value, padding included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One decoded output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    fields: Vec<Field>,
}

impl Record {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Raw bytes of the named field, including trailing padding.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.bytes.as_slice())
    }

    /// The named field as text with trailing NUL padding removed.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(|bytes| {
            let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        })
    }
}

/// Records decoded before the guest-reported count ran past the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBatch {
    pub records: Vec<Record>,
    /// Item count the guest reported.
    pub reported: u32,
}

impl PartialBatch {
    pub fn is_complete(&self) -> bool {
        self.records.len() as u64 == u64::from(self.reported)
    }
}

/// Write each event into its slot: event `i` lands at
/// `region.base_offset() + i * slot_stride`.
///
/// Events longer than `slot_stride` are silently truncated to the first
/// `slot_stride` bytes; the rest of a shorter slot is zero filled. The whole
/// batch is bounds-checked before any byte is written.
///
/// Returns the number of events that were truncated.
pub fn encode_batch<E: AsRef<[u8]>>(
    events: &[E],
    region: &MemoryRegion,
    slot_stride: u32,
    memory: &mut [u8],
) -> Result<usize> {
    if slot_stride == 0 {
        return Err(BridgeError::Layout("slot stride must be non-zero".into()));
    }
    let stride = slot_stride as usize;
    let needed = events.len() as u64 * u64::from(slot_stride);
    if needed > u64::from(region.capacity()) {
        return Err(BridgeError::out_of_bounds(
            0,
            needed,
            u64::from(region.capacity()),
        ));
    }
    // Whole-batch check against the memory view, so nothing is written when
    // a later slot would fail.
    region.read(memory, 0, needed as usize)?;

    let mut truncated = 0;
    for (i, event) in events.iter().enumerate() {
        let event = event.as_ref();
        let slot = i * stride;
        let len = if event.len() > stride {
            truncated += 1;
            tracing::warn!(
                index = i,
                event_len = event.len(),
                slot_stride,
                "event truncated to slot size"
            );
            stride
        } else {
            event.len()
        };
        region.write(memory, slot, &event[..len])?;
        region.fill(memory, slot + len, stride - len, 0)?;
    }
    Ok(truncated)
}

fn check_stride(item_stride: u32, layout: &RecordLayout) -> Result<()> {
    if u64::from(item_stride) < layout.width() {
        return Err(BridgeError::Layout(format!(
            "item stride {item_stride} is narrower than layout width {}",
            layout.width()
        )));
    }
    Ok(())
}

fn decode_items(
    region: &MemoryRegion,
    count: u32,
    item_stride: u32,
    layout: &RecordLayout,
    memory: &[u8],
) -> Result<Vec<Record>> {
    let stride = item_stride as usize;
    let mut records = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let window = region.read(memory, i * stride, stride)?;
        let mut at = 0;
        let fields = layout
            .fields()
            .iter()
            .map(|spec| {
                let width = spec.width as usize;
                let bytes = window[at..at + width].to_vec();
                at += width;
                Field {
                    name: spec.name.clone(),
                    bytes,
                }
            })
            .collect();
        records.push(Record { fields });
    }
    Ok(records)
}

/// Decode `item_count` records of `item_stride` bytes each from `region`.
///
/// Fails with [`BridgeError::TruncatedRegion`] if the reported records do
/// not fit in the region; nothing is read in that case.
pub fn decode_batch(
    region: &MemoryRegion,
    item_count: u32,
    item_stride: u32,
    layout: &RecordLayout,
    memory: &[u8],
) -> Result<Vec<Record>> {
    check_stride(item_stride, layout)?;
    let required = u64::from(item_count) * u64::from(item_stride);
    if required > u64::from(region.capacity()) {
        return Err(BridgeError::TruncatedRegion {
            required,
            available: u64::from(region.capacity()),
        });
    }
    decode_items(region, item_count, item_stride, layout, memory)
}

/// Like [`decode_batch`], but an over-reported count yields the records
/// that fit entirely within the region instead of an error.
pub fn decode_batch_partial(
    region: &MemoryRegion,
    item_count: u32,
    item_stride: u32,
    layout: &RecordLayout,
    memory: &[u8],
) -> Result<PartialBatch> {
    check_stride(item_stride, layout)?;
    let fit = (region.capacity() / item_stride).min(item_count);
    if fit < item_count {
        tracing::warn!(
            reported = item_count,
            decoded = fit,
            capacity = region.capacity(),
            "output region truncated, returning partial batch"
        );
    }
    let records = decode_items(region, fit, item_stride, layout, memory)?;
    Ok(PartialBatch {
        records,
        reported: item_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::region::Owner;
    use proptest::prelude::*;

    /// A single-field layout as wide as the slot, standing in for an
    /// identity guest that copies slots to the output unchanged.
    fn echo_layout(width: u32) -> RecordLayout {
        RecordLayout::new(vec![FieldSpec::new("data", width)]).unwrap()
    }

    fn region(len: usize, mem: &[u8]) -> MemoryRegion {
        MemoryRegion::new(0, len as u32, Owner::Guest, mem.len()).unwrap()
    }

    #[test]
    fn round_trip_keeps_order_and_truncates() {
        let stride = 8;
        let mut mem = vec![0u8; 64];
        let r = region(64, &mem);
        let events: Vec<&[u8]> = vec![b"abc", b"", b"exactly8", b"ninebytes", b"z"];
        let truncated = encode_batch(&events, &r, stride, &mut mem).unwrap();
        assert_eq!(truncated, 1);

        let records = decode_batch(&r, events.len() as u32, stride, &echo_layout(stride), &mem)
            .unwrap();
        assert_eq!(records.len(), events.len());
        for (event, record) in events.iter().zip(&records) {
            let keep = event.len().min(stride as usize);
            let data = record.get("data").unwrap();
            assert_eq!(&data[..keep], &event[..keep]);
            assert!(data[keep..].iter().all(|b| *b == 0));
        }
    }

    /// Stride, slot count, and a batch of at most that many events, each up
    /// to twice the stride long.
    fn batch_strategy() -> impl Strategy<Value = (u32, usize, Vec<Vec<u8>>)> {
        (1u32..=32, 1usize..=8).prop_flat_map(|(stride, slots)| {
            let event = proptest::collection::vec(any::<u8>(), 0..=2 * stride as usize);
            (
                Just(stride),
                Just(slots),
                proptest::collection::vec(event, 0..=slots),
            )
        })
    }

    proptest! {
        #[test]
        fn round_trip_truncates_every_batch((stride, slots, events) in batch_strategy()) {
            let capacity = stride as usize * slots;
            // Stale bytes make missing zero fill visible.
            let mut mem = vec![0xAAu8; capacity];
            let r = region(capacity, &mem);

            let truncated = encode_batch(&events, &r, stride, &mut mem).unwrap();
            let longer = events.iter().filter(|e| e.len() > stride as usize).count();
            prop_assert_eq!(truncated, longer);

            let records =
                decode_batch(&r, events.len() as u32, stride, &echo_layout(stride), &mem).unwrap();
            prop_assert_eq!(records.len(), events.len());
            for (event, record) in events.iter().zip(&records) {
                let keep = event.len().min(stride as usize);
                let data = record.get("data").unwrap();
                prop_assert_eq!(&data[..keep], &event[..keep]);
                prop_assert!(data[keep..].iter().all(|b| *b == 0));
            }
        }
    }

    #[test]
    fn exact_stride_is_kept_and_one_more_byte_is_lost() {
        let mut mem = vec![0u8; 16];
        let r = region(16, &mem);
        encode_batch(&[b"12345678".as_slice(), b"123456789"], &r, 8, &mut mem).unwrap();
        let records = decode_batch(&r, 2, 8, &echo_layout(8), &mem).unwrap();
        assert_eq!(records[0].get("data").unwrap(), b"12345678");
        assert_eq!(records[1].get("data").unwrap(), b"12345678");
    }

    #[test]
    fn empty_batch_decodes_to_empty() {
        let mut mem = vec![0u8; 16];
        let r = region(16, &mem);
        let events: Vec<Vec<u8>> = Vec::new();
        assert_eq!(encode_batch(&events, &r, 8, &mut mem).unwrap(), 0);
        let records = decode_batch(&r, 0, 8, &echo_layout(8), &mem).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn shorter_event_clears_stale_slot_bytes() {
        let mut mem = vec![0u8; 8];
        let r = region(8, &mem);
        encode_batch(&[b"longer!!"], &r, 8, &mut mem).unwrap();
        encode_batch(&[b"ab"], &r, 8, &mut mem).unwrap();
        assert_eq!(&mem, b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn too_many_events_is_rejected_before_writing() {
        let mut mem = vec![0u8; 16];
        let r = region(16, &mem);
        let err = encode_batch(&[b"a".as_slice(), b"b", b"c"], &r, 8, &mut mem).unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfBounds);
        assert!(mem.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_stride_is_a_layout_error() {
        let mut mem = vec![0u8; 16];
        let r = region(16, &mem);
        let err = encode_batch(&[b"a"], &r, 0, &mut mem).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Layout);
    }

    #[test]
    fn http_records_decode_in_order() {
        let stride = 128usize;
        let mut mem = vec![0u8; stride * 2];
        for (i, (method, path)) in [("GET", "/a"), ("PUT", "/b")].iter().enumerate() {
            let at = i * stride;
            mem[at..at + method.len()].copy_from_slice(method.as_bytes());
            let p = at + METHOD_WIDTH as usize;
            mem[p..p + path.len()].copy_from_slice(path.as_bytes());
        }
        let r = region(mem.len(), &mem);
        let records = decode_batch(&r, 2, 128, &RecordLayout::http_request(), &mem).unwrap();
        let pairs: Vec<(String, String)> = records
            .iter()
            .map(|r| (r.text("method").unwrap(), r.text("path").unwrap()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("GET".to_owned(), "/a".to_owned()),
                ("PUT".to_owned(), "/b".to_owned())
            ]
        );
        // The codec leaves padding in place.
        assert_eq!(records[0].get("method").unwrap(), b"GET\0\0\0\0\0");
        assert_eq!(records[0].get("path").unwrap().len(), PATH_WIDTH as usize);
    }

    #[test]
    fn wider_stride_skips_trailing_bytes() {
        let mut mem = vec![0u8; 24];
        mem[0..4].copy_from_slice(b"abcd");
        mem[12..16].copy_from_slice(b"efgh");
        let r = region(24, &mem);
        let records = decode_batch(&r, 2, 12, &echo_layout(4), &mem).unwrap();
        assert_eq!(records[0].get("data").unwrap(), b"abcd");
        assert_eq!(records[1].get("data").unwrap(), b"efgh");
    }

    #[test]
    fn fabricated_count_is_truncated_region() {
        let mem = vec![0u8; 256];
        let r = region(256, &mem);
        let err = decode_batch(&r, 3, 128, &RecordLayout::http_request(), &mem).unwrap_err();
        match err {
            BridgeError::TruncatedRegion {
                required,
                available,
            } => {
                assert_eq!(required, 384);
                assert_eq!(available, 256);
            }
            other => panic!("expected TruncatedRegion, got: {other}"),
        }
    }

    #[test]
    fn huge_count_does_not_overflow() {
        let mem = vec![0u8; 256];
        let r = region(256, &mem);
        let err = decode_batch(&r, u32::MAX, u32::MAX, &echo_layout(1), &mem).unwrap_err();
        assert_eq!(err.kind(), FailureKind::TruncatedRegion);
    }

    #[test]
    fn stride_narrower_than_layout_is_rejected() {
        let mem = vec![0u8; 256];
        let r = region(256, &mem);
        let err = decode_batch(&r, 1, 64, &RecordLayout::http_request(), &mem).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Layout);
    }

    #[test]
    fn partial_decode_returns_prefix() {
        let mut mem = vec![0u8; 20];
        mem[0] = b'x';
        mem[8] = b'y';
        let r = region(20, &mem);
        let partial = decode_batch_partial(&r, 5, 8, &echo_layout(8), &mem).unwrap();
        assert_eq!(partial.records.len(), 2);
        assert_eq!(partial.reported, 5);
        assert!(!partial.is_complete());
        assert_eq!(partial.records[1].get("data").unwrap()[0], b'y');
    }

    #[test]
    fn partial_decode_within_capacity_is_complete() {
        let mem = vec![0u8; 32];
        let r = region(32, &mem);
        let partial = decode_batch_partial(&r, 2, 8, &echo_layout(8), &mem).unwrap();
        assert!(partial.is_complete());
    }

    #[test]
    fn layout_validation() {
        assert!(RecordLayout::new(Vec::new()).is_err());
        assert!(RecordLayout::new(vec![FieldSpec::new("a", 0)]).is_err());
        assert!(
            RecordLayout::new(vec![FieldSpec::new("a", 1), FieldSpec::new("a", 2)]).is_err()
        );
        assert_eq!(RecordLayout::http_request().width(), 128);
    }

    #[test]
    fn text_trims_only_trailing_padding() {
        let record = Record {
            fields: vec![Field {
                name: "path".into(),
                bytes: b"/a\0b\0\0".to_vec(),
            }],
        };
        assert_eq!(record.text("path").unwrap(), "/a\0b");
        assert!(record.text("missing").is_none());
    }
}
