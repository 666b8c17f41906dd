//! Packet buffers
//!
//! A pbuf is a segment descriptor pointing into one of three kinds of storage:
//! a block of the payload pool, an allocation of the heap, or memory owned by
//! the caller (read-only `Rom` or writable `Ref`). Segments chain through
//! `next` to form one packet whose `tot_len` spans the rest of the chain, and
//! every descriptor is reference counted. A segment's payload is only released
//! when its count drops to zero, which may cascade down the chain.
//!
//! Descriptors, pool blocks and the heap all live in one [`PbufPool`], and
//! packets are named by [`PbufId`] handles into it.

use crate::BluetoothError;
use crate::constants::{
    MEM_SIZE, PBUF_DESC_COUNT, PBUF_LINK_HLEN, PBUF_POOL_BUFSIZE, PBUF_POOL_SIZE,
    PBUF_TRANSPORT_HLEN,
};
use crate::memb::{BlockId, Memb};
use crate::memr::{Memr, MemrPtr};

/// Which protocol layer the buffer is allocated for
///
/// Each layer reserves room in front of the payload for the headers
/// prepended below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PbufLayer {
    /// Room for the L2CAP, ACL and packet indicator headers
    Transport,
    /// Room for the ACL header and packet indicator
    Link,
    /// No headroom
    Raw,
}

impl PbufLayer {
    /// Headroom reserved in front of the payload
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::Transport => PBUF_LINK_HLEN + PBUF_TRANSPORT_HLEN,
            Self::Link => PBUF_LINK_HLEN,
            Self::Raw => 0,
        }
    }
}

/// Storage kind of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PbufKind {
    /// Payload in a fixed-size pool block; long packets chain several blocks
    Pool,
    /// Payload in one heap allocation
    Ram,
    /// Read-only memory owned elsewhere
    Rom,
    /// Writable memory owned elsewhere
    Ref,
}

#[derive(Debug)]
enum Payload {
    Pool(BlockId),
    Ram(MemrPtr),
    Rom(&'static [u8]),
    Ref(&'static mut [u8]),
    Detached(PbufKind),
}

impl Payload {
    fn kind(&self) -> PbufKind {
        match self {
            Self::Pool(_) => PbufKind::Pool,
            Self::Ram(_) => PbufKind::Ram,
            Self::Rom(_) => PbufKind::Rom,
            Self::Ref(_) => PbufKind::Ref,
            Self::Detached(kind) => *kind,
        }
    }
}

#[derive(Debug)]
struct Pbuf {
    next: Option<PbufId>,
    qnext: Option<PbufId>,
    payload: Payload,
    offset: usize,
    len: u16,
    tot_len: u16,
}

/// Handle to a packet buffer segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PbufId(BlockId);

/// Owner of every packet buffer, its payload pool and heap
#[derive(Debug)]
pub struct PbufPool {
    descs: Memb<Pbuf, PBUF_DESC_COUNT>,
    blocks: Memb<[u8; PBUF_POOL_BUFSIZE], PBUF_POOL_SIZE>,
    heap: Memr<MEM_SIZE>,
}

#[allow(clippy::cast_possible_truncation)]
const POOL_BUFSIZE: u16 = PBUF_POOL_BUFSIZE as u16;

impl PbufPool {
    /// Create empty pools
    #[must_use]
    pub fn new() -> Self {
        Self {
            descs: Memb::new(),
            blocks: Memb::new(),
            heap: Memr::new(),
        }
    }

    fn desc(&self, p: PbufId) -> Option<&Pbuf> {
        self.descs.get(p.0)
    }

    fn desc_mut(&mut self, p: PbufId) -> Option<&mut Pbuf> {
        self.descs.get_mut(p.0)
    }

    fn new_desc(&mut self, payload: Payload, offset: usize, len: u16, tot_len: u16) -> Option<PbufId> {
        let desc = Pbuf {
            next: None,
            qnext: None,
            payload,
            offset,
            len,
            tot_len,
        };
        match self.descs.alloc(desc) {
            Some(id) => Some(PbufId(id)),
            None => {
                warn!("pbuf: out of descriptors");
                None
            }
        }
    }

    fn pool_segment(&mut self, offset: usize, len: u16, tot_len: u16) -> Option<PbufId> {
        let block = self.blocks.alloc([0; PBUF_POOL_BUFSIZE])?;
        let seg = self.new_desc(Payload::Pool(block), offset, len, tot_len);
        if seg.is_none() {
            self.blocks.free(block);
        }
        seg
    }

    /// Allocate a packet buffer of `length` payload bytes
    ///
    /// Pool buffers longer than one block are chained automatically; if any block
    /// of the chain cannot be allocated everything taken so far is released.
    /// `Rom` and `Ref` buffers get a descriptor only, attach memory with
    /// [`PbufPool::attach_rom`] or [`PbufPool::attach_ref`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self, layer: PbufLayer, length: u16, kind: PbufKind) -> Option<PbufId> {
        let offset = layer.offset();
        match kind {
            PbufKind::Pool => {
                let first = length.min(POOL_BUFSIZE - offset as u16);
                let head = self.pool_segment(offset, first, length)?;
                let mut last = head;
                let mut rem = length - first;
                while rem > 0 {
                    let seg_len = rem.min(POOL_BUFSIZE);
                    let Some(seg) = self.pool_segment(0, seg_len, rem) else {
                        warn!("pbuf: pool exhausted allocating {} bytes", length);
                        self.free(head);
                        return None;
                    };
                    if let Some(desc) = self.desc_mut(last) {
                        desc.next = Some(seg);
                    }
                    last = seg;
                    rem -= seg_len;
                }
                Some(head)
            }
            PbufKind::Ram => {
                let ptr = self.heap.malloc((offset + usize::from(length)).max(1))?;
                let p = self.new_desc(Payload::Ram(ptr), offset, length, length);
                if p.is_none() {
                    self.heap.free(ptr);
                }
                p
            }
            PbufKind::Rom | PbufKind::Ref => {
                self.new_desc(Payload::Detached(kind), 0, length, length)
            }
        }
    }

    /// Allocate a read-only buffer over static memory
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc_rom(&mut self, data: &'static [u8]) -> Option<PbufId> {
        let len = u16::try_from(data.len()).ok()?;
        self.new_desc(Payload::Rom(data), 0, len, len)
    }

    /// Attach read-only memory to a `Rom` descriptor
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the descriptor is not a `Rom` buffer or `data` is shorter than its length
    pub fn attach_rom(&mut self, p: PbufId, data: &'static [u8]) -> Result<(), BluetoothError> {
        let desc = self.desc_mut(p).ok_or(BluetoothError::InvalidParameter)?;
        if desc.payload.kind() != PbufKind::Rom || data.len() < usize::from(desc.len) {
            return Err(BluetoothError::InvalidParameter);
        }
        desc.payload = Payload::Rom(data);
        desc.offset = 0;
        Ok(())
    }

    /// Attach caller-owned writable memory to a `Ref` descriptor
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the descriptor is not a `Ref` buffer or `data` is shorter than its length
    pub fn attach_ref(&mut self, p: PbufId, data: &'static mut [u8]) -> Result<(), BluetoothError> {
        let desc = self.desc_mut(p).ok_or(BluetoothError::InvalidParameter)?;
        if desc.payload.kind() != PbufKind::Ref || data.len() < usize::from(desc.len) {
            return Err(BluetoothError::InvalidParameter);
        }
        desc.payload = Payload::Ref(data);
        desc.offset = 0;
        Ok(())
    }

    /// Move the payload start by `inc` bytes, positive to prepend a header
    ///
    /// Pool and heap buffers cannot grow past the start of their storage.
    /// Caller-owned buffers carry no headroom and can only hide bytes.
    ///
    /// # Errors
    /// Returns `InvalidParameter` and leaves the buffer untouched if the move is impossible
    pub fn header(&mut self, p: PbufId, inc: i16) -> Result<(), BluetoothError> {
        let desc = self.desc_mut(p).ok_or(BluetoothError::InvalidParameter)?;
        let grow = usize::from(inc.unsigned_abs());
        let owned = matches!(desc.payload.kind(), PbufKind::Pool | PbufKind::Ram);
        if inc >= 0 {
            if !owned || grow > desc.offset {
                return Err(BluetoothError::InvalidParameter);
            }
            desc.offset -= grow;
        } else {
            if grow > usize::from(desc.len) {
                return Err(BluetoothError::InvalidParameter);
            }
            desc.offset += grow;
        }
        desc.len = desc.len.wrapping_add_signed(inc);
        desc.tot_len = desc.tot_len.wrapping_add_signed(inc);
        Ok(())
    }

    fn release_payload(&mut self, payload: Payload) {
        match payload {
            Payload::Pool(block) => {
                self.blocks.free(block);
            }
            Payload::Ram(ptr) => self.heap.free(ptr),
            Payload::Rom(_) | Payload::Ref(_) | Payload::Detached(_) => {}
        }
    }

    /// Drop one reference on every segment from `p` onwards
    ///
    /// Walks the chain releasing segments whose count reaches zero and stops at
    /// the first segment that is still referenced. Returns how many were released.
    pub fn free(&mut self, p: PbufId) -> u8 {
        let mut released = 0;
        let mut cur = Some(p);
        while let Some(id) = cur {
            let Some(desc) = self.descs.release(id.0) else {
                break;
            };
            released += 1;
            cur = desc.next;
            self.release_payload(desc.payload);
        }
        released
    }

    /// Take another reference on one segment
    pub fn inc_ref(&mut self, p: PbufId) {
        self.descs.inc_ref(p.0);
    }

    /// Reference count of a segment (zero once released)
    #[must_use]
    pub fn ref_count(&self, p: PbufId) -> u8 {
        self.descs.refs(p.0)
    }

    /// Shrink a chain to `new_len` bytes, releasing segments past the end
    ///
    /// Growing is not supported; a longer `new_len` leaves the chain as is.
    pub fn realloc(&mut self, p: PbufId, new_len: u16) {
        let Some(tot_len) = self.desc(p).map(|d| d.tot_len) else {
            return;
        };
        if new_len >= tot_len {
            return;
        }
        let shrink = tot_len - new_len;

        let mut rem = new_len;
        let mut q = p;
        loop {
            let Some(desc) = self.desc_mut(q) else {
                return;
            };
            if rem <= desc.len {
                break;
            }
            rem -= desc.len;
            desc.tot_len -= shrink;
            match desc.next {
                Some(next) => q = next,
                None => return,
            }
        }

        let Some(desc) = self.desc_mut(q) else {
            return;
        };
        let ram = match desc.payload {
            Payload::Ram(ptr) if rem != desc.len => Some((ptr, desc.offset)),
            _ => None,
        };
        desc.len = rem;
        desc.tot_len = rem;
        let tail = desc.next.take();
        if let Some((ptr, offset)) = ram {
            self.heap.realloc(ptr, offset + usize::from(rem));
        }
        if let Some(tail) = tail {
            self.free(tail);
        }
    }

    /// Number of segments in a chain
    #[must_use]
    pub fn clen(&self, p: PbufId) -> usize {
        let mut count = 0;
        let mut cur = Some(p);
        while let Some(id) = cur {
            count += 1;
            cur = self.next(id);
        }
        count
    }

    /// Append chain `t` to chain `h`, handing the caller's reference on `t` to `h`
    pub fn cat(&mut self, h: PbufId, t: PbufId) {
        let t_len = self.tot_len(t);
        let mut cur = h;
        while let Some(desc) = self.desc_mut(cur) {
            desc.tot_len += t_len;
            match desc.next {
                Some(next) => cur = next,
                None => {
                    desc.next = Some(t);
                    break;
                }
            }
        }
    }

    /// Append chain `t` to chain `h`; the caller keeps its own reference on `t`
    pub fn chain(&mut self, h: PbufId, t: PbufId) {
        self.cat(h, t);
        self.inc_ref(t);
    }

    /// Split the first segment off a chain
    ///
    /// Returns the tail if it is still referenced elsewhere, `None` if dropping
    /// the head's link released it.
    pub fn dechain(&mut self, p: PbufId) -> Option<PbufId> {
        let desc = self.desc_mut(p)?;
        let q = desc.next.take()?;
        let rest = desc.tot_len - desc.len;
        desc.tot_len = desc.len;
        if let Some(tail) = self.desc_mut(q) {
            tail.tot_len = rest;
        }
        if self.free(q) > 0 { None } else { Some(q) }
    }

    /// Put packet `n` at the end of the packet queue starting at `p`
    ///
    /// The queue takes over the caller's reference on `n`.
    pub fn queue(&mut self, p: PbufId, n: PbufId) {
        let mut cur = p;
        while let Some(desc) = self.desc_mut(cur) {
            match desc.qnext {
                Some(next) => cur = next,
                None => {
                    desc.qnext = Some(n);
                    break;
                }
            }
        }
    }

    /// Detach and return the packet queued after `p`
    pub fn dequeue(&mut self, p: PbufId) -> Option<PbufId> {
        self.desc_mut(p)?.qnext.take()
    }

    fn copy_segment(&mut self, src: PbufId, dst: PbufId, len: usize) -> Result<(), BluetoothError> {
        let mut chunk = [0u8; 32];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            let from = self
                .payload(src)
                .get(done..done + n)
                .ok_or(BluetoothError::InvalidParameter)?;
            chunk[..n].copy_from_slice(from);
            self.payload_mut(dst)
                .and_then(|to| to.get_mut(done..done + n))
                .ok_or(BluetoothError::InvalidParameter)?
                .copy_from_slice(&chunk[..n]);
            done += n;
        }
        Ok(())
    }

    /// Replace every `Ref` segment of a chain with a pool or heap copy
    ///
    /// Returns the (possibly new) head. On allocation failure the whole chain is
    /// freed and `None` is returned.
    pub fn take(&mut self, p: PbufId) -> Option<PbufId> {
        let mut head = p;
        let mut prev: Option<PbufId> = None;
        let mut cur = Some(p);
        while let Some(id) = cur {
            let mut seg = id;
            if self.kind(id) == Some(PbufKind::Ref) {
                let (len, tot_len) = (self.len(id), self.tot_len(id));
                let copy = self.single_segment_copy(len);
                let Some(copy) = copy else {
                    error!("pbuf_take: could not allocate a copy of {} bytes", len);
                    self.free(head);
                    return None;
                };
                if self.copy_segment(id, copy, usize::from(len)).is_err() {
                    self.free(copy);
                    self.free(head);
                    return None;
                }
                let next = self.desc_mut(id).and_then(|d| d.next.take());
                if let Some(desc) = self.desc_mut(copy) {
                    desc.next = next;
                    desc.tot_len = tot_len;
                }
                match prev {
                    Some(prev) => {
                        if let Some(desc) = self.desc_mut(prev) {
                            desc.next = Some(copy);
                        }
                    }
                    None => head = copy,
                }
                self.free(id);
                seg = copy;
            }
            prev = Some(seg);
            cur = self.next(seg);
        }
        Some(head)
    }

    fn single_segment_copy(&mut self, len: u16) -> Option<PbufId> {
        if let Some(q) = self.alloc(PbufLayer::Raw, len, PbufKind::Pool) {
            if self.next(q).is_none() {
                return Some(q);
            }
            self.free(q);
        }
        self.alloc(PbufLayer::Raw, len, PbufKind::Ram)
    }

    /// Payload bytes of one segment
    #[must_use]
    pub fn payload(&self, p: PbufId) -> &[u8] {
        let Some(desc) = self.desc(p) else {
            return &[];
        };
        let region: &[u8] = match &desc.payload {
            Payload::Pool(block) => self.blocks.get(*block).map(|b| &b[..]).unwrap_or(&[]),
            Payload::Ram(ptr) => self.heap.bytes(*ptr),
            Payload::Rom(data) => data,
            Payload::Ref(data) => data,
            Payload::Detached(_) => &[],
        };
        region
            .get(desc.offset..desc.offset + usize::from(desc.len))
            .unwrap_or(&[])
    }

    /// Writable payload bytes of one segment, `None` for read-only buffers
    pub fn payload_mut(&mut self, p: PbufId) -> Option<&mut [u8]> {
        let desc = self.descs.get_mut(p.0)?;
        let range = desc.offset..desc.offset + usize::from(desc.len);
        match &mut desc.payload {
            Payload::Pool(block) => {
                let block = *block;
                self.blocks.get_mut(block)?.get_mut(range)
            }
            Payload::Ram(ptr) => {
                let ptr = *ptr;
                self.heap.bytes_mut(ptr).get_mut(range)
            }
            Payload::Ref(data) => data.get_mut(range),
            Payload::Rom(_) | Payload::Detached(_) => None,
        }
    }

    /// Copy bytes out of a chain starting at `offset`, returning how many were copied
    pub fn copy_out(&self, p: PbufId, offset: usize, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for part in self.segments_range(p, offset, buf.len()) {
            buf[copied..copied + part.len()].copy_from_slice(part);
            copied += part.len();
        }
        copied
    }

    /// Write `data` into a chain starting at `offset`, crossing segment boundaries
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the chain is too short or a segment is read-only
    pub fn copy_in(&mut self, p: PbufId, offset: usize, data: &[u8]) -> Result<(), BluetoothError> {
        let mut skip = offset;
        let mut written = 0;
        let mut cur = Some(p);
        while let Some(id) = cur {
            if written == data.len() {
                break;
            }
            let next = self.next(id);
            let seg_len = usize::from(self.len(id));
            if skip >= seg_len {
                skip -= seg_len;
            } else {
                let n = (seg_len - skip).min(data.len() - written);
                let payload = self.payload_mut(id).ok_or(BluetoothError::InvalidParameter)?;
                payload[skip..skip + n].copy_from_slice(&data[written..written + n]);
                written += n;
                skip = 0;
            }
            cur = next;
        }
        if written == data.len() {
            Ok(())
        } else {
            Err(BluetoothError::InvalidParameter)
        }
    }

    /// Read one byte at `offset` of a chain
    #[must_use]
    pub fn read_u8(&self, p: PbufId, offset: usize) -> Option<u8> {
        let mut byte = [0u8; 1];
        (self.copy_out(p, offset, &mut byte) == 1).then_some(byte[0])
    }

    /// Read a little-endian `u16` at `offset` of a chain
    #[must_use]
    pub fn read_u16_le(&self, p: PbufId, offset: usize) -> Option<u16> {
        let mut raw = [0u8; 2];
        (self.copy_out(p, offset, &mut raw) == 2).then(|| u16::from_le_bytes(raw))
    }

    /// Bytes in this segment
    #[must_use]
    pub fn len(&self, p: PbufId) -> u16 {
        self.desc(p).map_or(0, |d| d.len)
    }

    /// Bytes in this segment and every following one
    #[must_use]
    pub fn tot_len(&self, p: PbufId) -> u16 {
        self.desc(p).map_or(0, |d| d.tot_len)
    }

    /// Following segment of the chain
    #[must_use]
    pub fn next(&self, p: PbufId) -> Option<PbufId> {
        self.desc(p)?.next
    }

    /// Storage kind of a live segment
    #[must_use]
    pub fn kind(&self, p: PbufId) -> Option<PbufKind> {
        self.desc(p).map(|d| d.payload.kind())
    }

    /// Iterate over the payload slices of a whole chain
    #[must_use]
    pub fn segments(&self, p: PbufId) -> Segments<'_> {
        self.segments_range(p, 0, usize::from(self.tot_len(p)))
    }

    /// Iterate over `len` bytes of a chain starting `offset` bytes in
    #[must_use]
    pub fn segments_range(&self, p: PbufId, offset: usize, len: usize) -> Segments<'_> {
        Segments {
            pool: self,
            next: Some(p),
            skip: offset,
            remaining: len,
        }
    }

    /// Number of descriptors in use
    #[must_use]
    pub fn descriptors_in_use(&self) -> usize {
        self.descs.used()
    }

    /// Number of pool payload blocks in use
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.blocks.used()
    }

    /// Free bytes left in the heap
    #[must_use]
    pub fn heap_free(&self) -> usize {
        self.heap.free_bytes()
    }
}

impl Default for PbufPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload slices of a chain, in order
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    pool: &'a PbufPool,
    next: Option<PbufId>,
    skip: usize,
    remaining: usize,
}

impl<'a> Segments<'a> {
    /// An iterator yielding nothing
    #[must_use]
    pub fn empty(pool: &'a PbufPool) -> Self {
        Self {
            pool,
            next: None,
            skip: 0,
            remaining: 0,
        }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.remaining > 0 {
            let id = self.next?;
            let payload = self.pool.payload(id);
            self.next = self.pool.next(id);
            if self.skip >= payload.len() {
                self.skip -= payload.len();
                continue;
            }
            let start = self.skip;
            let end = payload.len().min(start + self.remaining);
            self.skip = 0;
            self.remaining -= end - start;
            return Some(&payload[start..end]);
        }
        None
    }
}
