#![allow(clippy::missing_safety_doc)]

//! Fixed-arena binary-buddy allocator.
//!
//! One `mmap`'d region carries its own metadata prefix (allocation-state
//! bytes, per-class free-list head/tail arrays, per-class availability bit
//! trees) followed by the usable segments. `take` and `give` operate on byte
//! offsets into that single region; raw pointers appear only at the public
//! boundary.

use core::{
  alloc::Layout,
  fmt,
  marker::PhantomData,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
};
use std::{alloc, alloc::handle_alloc_error, cell::RefCell, rc::Rc};

use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Smallest block size in bytes. Every free block hosts its own list node, so
/// this must hold one [`FreeNode`].
pub const MINIMUM: usize = 16;

/// Empty-list sentinel for the intrusive free lists.
const NONE: i64 = -1;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MINIMUM.is_power_of_two());
const _: () = assert!(size_of::<FreeNode>() == 16);
const _: () = assert!(MINIMUM >= size_of::<FreeNode>());

// =============================================================================
// Types
// =============================================================================

/// Intrusive free-list node written into the first two words of a free block.
/// Overwritten by user data once the block is handed out.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct FreeNode {
  /// Previous block in the same class's list, [`NONE`] if head.
  prev: i64,
  /// Next block in the same class's list, [`NONE`] if tail.
  next: i64,
}

/// Structured allocator events, delivered to the sink installed at
/// construction. `CorruptHead` and `InvalidFree` indicate caller misuse or
/// metadata corruption; the rest trace normal operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
  Init { layers: usize, segments: usize },
  Take { class: usize, index: usize, size: usize },
  Give { class: usize, index: usize },
  Split { class: usize, index: usize },
  Merge { class: usize, index: usize },
  CorruptHead { class: usize, index: usize },
  InvalidFree { offset: usize },
}

/// Event sink. A plain function pointer so the arena never allocates on its
/// own behalf.
pub type TraceSink = fn(TraceEvent);

fn sink_silent(_: TraceEvent) {}

/// Ready-made sink forwarding events to the `log` facade: `warn!` for misuse
/// and corruption events, `trace!` for everything else.
pub fn log_sink(event: TraceEvent) {
  match event {
    TraceEvent::CorruptHead { class, index } => {
      log::warn!("free-list head of class {class} corrupted at index {index}, list dropped");
    }
    TraceEvent::InvalidFree { offset } => {
      log::warn!("give at offset {offset} does not match a live allocation");
    }
    other => log::trace!("{other:?}"),
  }
}

/// Construction-time failures. Steady-state conditions (exhaustion, invalid
/// free) are ordinary results, never errors.
#[derive(Debug, Error)]
pub enum ArenaError {
  #[error("region of {len} bytes cannot hold the metadata plus one segment (need {need})")]
  RegionTooSmall { len: usize, need: usize },
  #[error("anonymous mapping of {len} bytes failed")]
  MapFailed { len: usize },
}

// =============================================================================
// Platform
// =============================================================================

/// Owned anonymous mapping. Reserved once at construction, unmapped on drop.
struct Region {
  ptr: NonNull<u8>,
  len: usize,
}

impl Region {
  fn map(len: usize) -> Result<Self, ArenaError> {
    let raw = unsafe {
      libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if raw == libc::MAP_FAILED {
      return Err(ArenaError::MapFailed { len });
    }
    let ptr = NonNull::new(raw as *mut u8).ok_or(ArenaError::MapFailed { len })?;
    Ok(Self { ptr, len })
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
  }
}

// =============================================================================
// Geometry
// =============================================================================

/// Rounds `x` up to the next multiple of `align`, a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Number of size classes for a region of `len` bytes: repeated round-up
/// halving until the minimum block size is reached.
const fn layer_count(len: usize) -> usize {
  let mut layers = 1;
  let mut con = len;
  while con > MINIMUM {
    con = (con >> 1) + (con & 1);
    layers += 1;
  }
  layers
}

/// Block size in bytes for `class` in a forest of `layers` classes. Class 0
/// is the coarsest, class `layers - 1` is [`MINIMUM`].
#[inline(always)]
const fn block_size_for(layers: usize, class: usize) -> usize {
  MINIMUM << (layers - class - 1)
}

/// Node count of tree `layer`, padded to even so the sibling of the last node
/// always reads inside the same branch.
#[inline(always)]
const fn layer_bits(len: usize, layers: usize, layer: usize) -> usize {
  let size = block_size_for(layers, layer);
  let bits = (len + size - 1) / size;
  (bits + 1) & !1
}

/// `u64` words required for one layer of one class's tree.
#[inline(always)]
const fn layer_words(len: usize, layers: usize, layer: usize) -> usize {
  (layer_bits(len, layers, layer) + 63) / 64
}

// =============================================================================
// Arena
// =============================================================================

/// A binary-buddy allocator over one fixed anonymous mapping.
///
/// Single-threaded by contract: callers using an instance from several
/// threads must serialize every `take`/`give` externally.
pub struct BuddyArena {
  region: Region,
  /// Number of size classes; immutable after construction.
  layers: usize,
  /// Usable minimum segments after the metadata prefix.
  segments: usize,
  /// Metadata prefix offsets. The allocation-state array sits at offset 0.
  heads_ofs: usize,
  tails_ofs: usize,
  bits_ofs: usize,
  /// First usable byte; MINIMUM-aligned within the mapping.
  base_ofs: usize,
  /// Word offset of each (class, layer) branch within the bit storage,
  /// triangular by class.
  branch_ofs: Vec<usize>,
  trace: TraceSink,
}

// SAFETY: the mapping is exclusively owned and nothing aliases it, so the
// arena may move between threads. It is deliberately not Sync.
unsafe impl Send for BuddyArena {}

impl BuddyArena {
  /// Creates an arena over a fresh anonymous mapping of `len` bytes with no
  /// event sink.
  pub fn new(len: usize) -> Result<Self, ArenaError> {
    Self::with_trace(len, sink_silent)
  }

  /// Creates an arena delivering [`TraceEvent`]s to `trace`.
  pub fn with_trace(len: usize, trace: TraceSink) -> Result<Self, ArenaError> {
    let layers = layer_count(len);

    // Metadata prefix, fixed order: allocation-state array, list head array,
    // list tail array, bit-tree storage, then the usable region.
    let state_len = len / MINIMUM;
    let heads_ofs = align_up(state_len, 8);
    let tails_ofs = heads_ofs + layers * 8;
    let bits_ofs = tails_ofs + layers * 8;

    let mut branch_ofs = Vec::with_capacity(layers * (layers + 1) / 2);
    let mut words = 0usize;
    for class in 0..layers {
      for layer in 0..=class {
        branch_ofs.push(words);
        words += layer_words(len, layers, layer);
      }
    }
    let base_ofs = align_up(bits_ofs + words * 8, MINIMUM);

    if len < MINIMUM || base_ofs + MINIMUM > len {
      return Err(ArenaError::RegionTooSmall { len, need: base_ofs + MINIMUM });
    }

    let region = Region::map(len)?;
    let segments = (len - base_ofs) / MINIMUM;
    let mut tree = Self {
      region,
      layers,
      segments,
      heads_ofs,
      tails_ofs,
      bits_ofs,
      base_ofs,
      branch_ofs,
      trace,
    };

    // Anonymous pages arrive zeroed, but the layout contract is an explicit
    // zero-fill of the state array and bit storage.
    unsafe { ptr::write_bytes(tree.mem(), 0, base_ofs) };
    for class in 0..layers {
      tree.set_head(class, NONE);
      tree.set_tail(class, NONE);
    }

    // Greedy change-making: cover the usable region with the largest blocks
    // that fit, coarsest first, seeding each in its own class. The length
    // need not be a power of two, so the remainder falls through to
    // progressively finer classes.
    let mut rem = segments * MINIMUM;
    let mut offset = 0usize;
    for class in 0..layers {
      let size = tree.block_size(class);
      if size <= rem {
        tree.raise_path(class, offset / size);
        rem -= size;
        offset += size;
      }
    }

    tree.emit(TraceEvent::Init { layers, segments });
    Ok(tree)
  }

  #[inline]
  fn emit(&self, event: TraceEvent) {
    (self.trace)(event)
  }

  // ---------------------------------------------------------------------------
  // Metadata accessors
  // ---------------------------------------------------------------------------

  #[inline]
  fn mem(&self) -> *mut u8 {
    self.region.ptr.as_ptr()
  }

  /// Allocation-state byte of a minimum segment: 0 unclaimed, `class + 1` a
  /// live allocation, `!class` queued in that class's free list.
  #[inline]
  fn state(&self, seg: usize) -> i8 {
    debug_assert!(seg < self.region.len / MINIMUM);
    unsafe { (self.mem().add(seg) as *const i8).read() }
  }

  #[inline]
  fn set_state(&mut self, seg: usize, marker: i8) {
    debug_assert!(seg < self.region.len / MINIMUM);
    unsafe { (self.mem().add(seg) as *mut i8).write(marker) }
  }

  #[inline]
  fn head(&self, class: usize) -> i64 {
    unsafe { (self.mem().add(self.heads_ofs + class * 8) as *const i64).read() }
  }

  #[inline]
  fn set_head(&mut self, class: usize, index: i64) {
    unsafe { (self.mem().add(self.heads_ofs + class * 8) as *mut i64).write(index) }
  }

  #[inline]
  fn tail(&self, class: usize) -> i64 {
    unsafe { (self.mem().add(self.tails_ofs + class * 8) as *const i64).read() }
  }

  #[inline]
  fn set_tail(&mut self, class: usize, index: i64) {
    unsafe { (self.mem().add(self.tails_ofs + class * 8) as *mut i64).write(index) }
  }

  /// Byte offset of the `u64` word holding bit `index` of (class, layer).
  #[inline]
  fn word_ofs(&self, class: usize, layer: usize, index: usize) -> usize {
    debug_assert!(layer <= class && class < self.layers);
    debug_assert!(index < layer_bits(self.region.len, self.layers, layer));
    let branch = self.branch_ofs[class * (class + 1) / 2 + layer];
    self.bits_ofs + (branch + index / 64) * 8
  }

  #[inline]
  fn bit(&self, class: usize, layer: usize, index: usize) -> bool {
    let word = unsafe { (self.mem().add(self.word_ofs(class, layer, index)) as *const u64).read() };
    word >> (index % 64) & 1 != 0
  }

  #[inline]
  fn set_bit(&mut self, class: usize, layer: usize, index: usize) {
    let word = unsafe { &mut *(self.mem().add(self.word_ofs(class, layer, index)) as *mut u64) };
    *word |= 1 << (index % 64);
  }

  #[inline]
  fn clear_bit(&mut self, class: usize, layer: usize, index: usize) {
    let word = unsafe { &mut *(self.mem().add(self.word_ofs(class, layer, index)) as *mut u64) };
    *word &= !(1 << (index % 64));
  }

  /// First minimum segment covered by block `index` of `class`.
  #[inline]
  fn segment_of(&self, class: usize, index: usize) -> usize {
    index << (self.layers - class - 1)
  }

  #[inline]
  fn block_ptr(&self, class: usize, index: usize) -> *mut u8 {
    unsafe { self.mem().add(self.base_ofs + index * self.block_size(class)) }
  }

  #[inline]
  fn node_ptr(&self, class: usize, index: usize) -> *mut FreeNode {
    self.block_ptr(class, index) as *mut FreeNode
  }

  #[inline]
  fn node(&self, class: usize, index: usize) -> FreeNode {
    unsafe { self.node_ptr(class, index).read() }
  }

  #[inline]
  fn set_node(&mut self, class: usize, index: usize, node: FreeNode) {
    unsafe { self.node_ptr(class, index).write(node) }
  }

  /// State-byte marker of a block queued at `class`.
  #[inline]
  fn queued(class: usize) -> i8 {
    !(class as i8)
  }

  // ---------------------------------------------------------------------------
  // Availability bit-tree engine
  // ---------------------------------------------------------------------------

  /// Sets the bit at every layer from `class` up to the root. Ancestors must
  /// always reflect new availability below them.
  fn raise_path(&mut self, class: usize, mut index: usize) {
    for layer in (0..=class).rev() {
      self.set_bit(class, layer, index);
      index /= 2;
    }
  }

  /// Clears the leaf bit, then clears ancestors root-ward only while the
  /// sibling pair below is fully clear. Stops at the first surviving sibling,
  /// which still justifies the remaining ancestors.
  fn lower_path(&mut self, class: usize, mut index: usize) {
    self.clear_bit(class, class, index);
    index /= 2;
    for layer in (0..class).rev() {
      if self.sibling_pair(class, layer, index) != 0 {
        break;
      }
      self.clear_bit(class, layer, index);
      index /= 2;
    }
  }

  /// The two child bits of node (class, layer, index) as a packed pair: bit 0
  /// the left child, bit 1 the right. `3` means both available.
  fn sibling_pair(&self, class: usize, layer: usize, index: usize) -> u64 {
    debug_assert!(layer < class);
    let left = self.bit(class, layer + 1, 2 * index) as u64;
    let right = self.bit(class, layer + 1, 2 * index + 1) as u64;
    left | right << 1
  }

  /// Walks from the root to a free leaf of `class`, preferring the left child
  /// at every layer. The root bit must be set.
  fn locate_free(&self, class: usize) -> usize {
    debug_assert!(self.bit(class, 0, 0));
    let mut index = 0;
    for layer in 0..class {
      let pair = self.sibling_pair(class, layer, index);
      index = 2 * index + usize::from(pair & 1 == 0);
    }
    index
  }

  // ---------------------------------------------------------------------------
  // Free-list manager
  // ---------------------------------------------------------------------------

  /// Inserts block `index` at the head of `class`'s list and marks its state
  /// byte queued.
  fn push(&mut self, class: usize, index: usize) {
    let old = self.head(class);
    if old >= 0 {
      let mut node = self.node(class, old as usize);
      node.prev = index as i64;
      self.set_node(class, old as usize, node);
    }
    let seg = self.segment_of(class, index);
    self.set_state(seg, Self::queued(class));
    self.set_node(class, index, FreeNode { prev: NONE, next: old });
    self.set_head(class, index as i64);
    if self.tail(class) < 0 {
      self.set_tail(class, index as i64);
    }
  }

  /// Removes and returns the head of `class`'s list. A head whose state byte
  /// lost the queued marker means the node words were overwritten; the whole
  /// list is dropped (reported) rather than dereferenced.
  fn pop(&mut self, class: usize) -> Option<usize> {
    let head = self.head(class);
    if head < 0 {
      return None;
    }
    let index = head as usize;
    let seg = self.segment_of(class, index);
    if self.state(seg) != Self::queued(class) {
      self.set_head(class, NONE);
      self.set_tail(class, NONE);
      self.emit(TraceEvent::CorruptHead { class, index });
      log::warn!("class {class} free list dropped: head {index} lost its queued marker");
      return None;
    }
    let next = self.node(class, index).next;
    self.set_head(class, next);
    if next >= 0 {
      let mut node = self.node(class, next as usize);
      node.prev = NONE;
      self.set_node(class, next as usize, node);
    }
    if self.tail(class) == head {
      self.set_tail(class, NONE);
    }
    self.set_state(seg, 0);
    Some(index)
  }

  /// Unlinks block `index` from wherever it sits in `class`'s list. No-op if
  /// the state byte does not show it resident.
  fn remove(&mut self, class: usize, index: usize) {
    let seg = self.segment_of(class, index);
    if self.state(seg) != Self::queued(class) {
      return;
    }
    let node = self.node(class, index);
    self.set_state(seg, 0);
    if node.prev >= 0 {
      let mut prev = self.node(class, node.prev as usize);
      prev.next = node.next;
      self.set_node(class, node.prev as usize, prev);
    } else {
      self.set_head(class, node.next);
    }
    if node.next >= 0 {
      let mut next = self.node(class, node.next as usize);
      next.prev = node.prev;
      self.set_node(class, node.next as usize, next);
    } else {
      self.set_tail(class, node.prev);
    }
  }

  // ---------------------------------------------------------------------------
  // Split/merge engine
  // ---------------------------------------------------------------------------

  /// Splits the free block (class, index) into two buddies one class finer.
  /// Returns the left child as the in-progress allocation target; the right
  /// child stays genuinely free and discoverable.
  fn split(&mut self, class: usize, index: usize) -> usize {
    self.emit(TraceEvent::Split { class, index });
    self.remove(class, index);
    self.lower_path(class, index);
    let left = 2 * index;
    self.raise_path(class + 1, left);
    // The right child shares every raised ancestor; only its leaf is new.
    self.set_bit(class + 1, class + 1, left + 1);
    left
  }

  /// Recombines the confirmed-free buddy pair under (class, index) one class
  /// coarser. Callers must have removed both children from the free lists.
  fn merge(&mut self, class: usize, index: usize) {
    self.emit(TraceEvent::Merge { class, index });
    self.clear_bit(class + 1, class + 1, 2 * index + 1);
    self.lower_path(class + 1, 2 * index);
    self.raise_path(class, index);
  }

  // ---------------------------------------------------------------------------
  // Allocation orchestrator
  // ---------------------------------------------------------------------------

  /// Finest class whose block size fits `size`, or `None` when the request
  /// exceeds the coarsest class.
  fn class_for(&self, size: usize) -> Option<usize> {
    if size > self.block_size(0) {
      return None;
    }
    let mut class = self.layers - 1;
    while size > self.block_size(class) {
      class -= 1;
    }
    Some(class)
  }

  /// Produces a free block of exactly `class`: cached list entry first, then
  /// a tree walk, then a recursive split one class coarser. `None` once class
  /// 0 is exhausted.
  fn obtain(&mut self, class: usize) -> Option<usize> {
    if let Some(index) = self.pop(class) {
      return Some(index);
    }
    if !self.bit(class, 0, 0) {
      if class == 0 {
        return None;
      }
      let parent = self.obtain(class - 1)?;
      return Some(self.split(class - 1, parent));
    }
    let index = self.locate_free(class);
    // Walk-located blocks may still be queued; unlinking keeps the lists and
    // state bytes agreeing.
    self.remove(class, index);
    Some(index)
  }

  /// Allocates a block of at least `size` bytes. `None` on exhaustion or
  /// when `size` exceeds the coarsest class.
  pub fn take(&mut self, size: usize) -> Option<NonNull<u8>> {
    let class = self.class_for(size)?;
    let index = self.obtain(class)?;
    self.lower_path(class, index);
    self.set_state(self.segment_of(class, index), class as i8 + 1);
    self.emit(TraceEvent::Take { class, index, size });
    NonNull::new(self.block_ptr(class, index))
  }

  /// Returns a previously taken block. Null pointers, foreign pointers and
  /// segments not recording a live allocation are reported no-ops.
  pub fn give(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let addr = ptr as usize;
    let base = self.mem() as usize + self.base_ofs;
    let end = base + self.segments * MINIMUM;
    if addr < base || addr >= end || (addr - base) % MINIMUM != 0 {
      self.emit(TraceEvent::InvalidFree { offset: addr.wrapping_sub(base) });
      log::warn!("give: {ptr:p} is not a block of this arena");
      return;
    }

    let offset = addr - base;
    let seg = offset / MINIMUM;
    let marker = self.state(seg);
    if marker <= 0 {
      self.emit(TraceEvent::InvalidFree { offset });
      log::warn!("give: segment {seg} does not record a live allocation");
      return;
    }

    let mut class = (marker - 1) as usize;
    let mut index = offset / self.block_size(class);
    self.set_state(seg, 0);
    self.raise_path(class, index);
    self.emit(TraceEvent::Give { class, index });

    // Coalesce: while the sibling pair at the parent is fully available,
    // pull both children out of the lists and merge one class coarser.
    while class > 0 {
      let parent = index / 2;
      if self.sibling_pair(class, class - 1, parent) != 3 {
        break;
      }
      self.remove(class, 2 * parent);
      self.remove(class, 2 * parent + 1);
      self.merge(class - 1, parent);
      class -= 1;
      index = parent;
    }

    self.push(class, index);
  }

  // ---------------------------------------------------------------------------
  // Diagnostics
  // ---------------------------------------------------------------------------

  /// Number of size classes.
  pub fn layers(&self) -> usize {
    self.layers
  }

  /// Usable minimum segments.
  pub fn segments(&self) -> usize {
    self.segments
  }

  /// Usable capacity in bytes.
  pub fn capacity(&self) -> usize {
    self.segments * MINIMUM
  }

  /// Block size in bytes of `class`.
  pub fn block_size(&self, class: usize) -> usize {
    block_size_for(self.layers, class)
  }

  /// Count of free blocks of exactly `class`. Observation only.
  pub fn free_count(&self, class: usize) -> usize {
    (0..self.class_blocks(class))
      .filter(|&index| self.bit(class, class, index))
      .count()
  }

  /// Whole blocks of `class` that fit in the usable region.
  fn class_blocks(&self, class: usize) -> usize {
    self.segments >> (self.layers - class - 1)
  }
}

impl fmt::Debug for BuddyArena {
  /// Renders availability per class, the allocation and queue maps, and the
  /// free-list chains. `{:#?}` adds the interior tree layers.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "BuddyArena: {} layers, {} segments, {} usable bytes",
      self.layers,
      self.segments,
      self.capacity()
    )?;

    for class in 0..self.layers {
      write!(f, "class {:2} ({:>8} bytes): ", class, self.block_size(class))?;
      if f.alternate() {
        for layer in 0..class {
          let blocks = self.segments >> (self.layers - layer - 1);
          for index in 0..blocks {
            write!(f, "{}", u8::from(self.bit(class, layer, index)))?;
          }
          write!(f, " / ")?;
        }
      }
      for index in 0..self.class_blocks(class) {
        write!(f, "{}", u8::from(self.bit(class, class, index)))?;
      }
      writeln!(f)?;
    }

    write!(f, "allocated: ")?;
    for seg in 0..self.segments {
      let marker = self.state(seg);
      if marker > 0 {
        write!(f, "{}", char::from_digit((marker - 1) as u32, 36).unwrap_or('?'))?;
      } else {
        write!(f, "-")?;
      }
    }
    writeln!(f)?;

    write!(f, "queued:    ")?;
    for seg in 0..self.segments {
      let marker = self.state(seg);
      if marker < 0 {
        write!(f, "{}", char::from_digit(!marker as u32, 36).unwrap_or('?'))?;
      } else {
        write!(f, "-")?;
      }
    }
    writeln!(f)?;

    for class in 0..self.layers {
      let mut index = self.head(class);
      if index < 0 {
        continue;
      }
      write!(f, "stack {class}: ")?;
      let mut hops = 0;
      while index >= 0 && hops <= self.segments {
        let node = self.node(class, index as usize);
        write!(f, "{index} ({}, {}), ", node.prev, node.next)?;
        index = node.next;
        hops += 1;
      }
      writeln!(f)?;
    }
    Ok(())
  }
}

// =============================================================================
// Container adapters
// =============================================================================

/// Typed two-operation capability over a shared arena, for use by generic
/// containers. `allocate` scales by element size and signals exhaustion via
/// [`handle_alloc_error`]; `deallocate` never fails. Two adapters bound to
/// the same arena compare equal.
#[derive(Debug)]
pub struct ArenaAllocator<T> {
  arena: Rc<RefCell<BuddyArena>>,
  _elem: PhantomData<T>,
}

impl<T> ArenaAllocator<T> {
  pub fn new(arena: Rc<RefCell<BuddyArena>>) -> Self {
    debug_assert!(align_of::<T>() <= MINIMUM);
    Self { arena, _elem: PhantomData }
  }

  /// Allocates room for `count` elements. Never returns null: exhaustion and
  /// impossible layouts abort through [`handle_alloc_error`].
  pub fn allocate(&self, count: usize) -> NonNull<T> {
    let Ok(layout) = Layout::array::<T>(count) else {
      handle_alloc_error(Layout::new::<T>())
    };
    match self.arena.borrow_mut().take(layout.size()) {
      Some(ptr) => {
        log::debug!("arena allocated {} bytes at {:p}", layout.size(), ptr);
        ptr.cast()
      }
      None => handle_alloc_error(layout),
    }
  }

  /// Returns `count` elements' worth of memory at `ptr` to the arena.
  pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
    log::debug!(
      "arena freed {} bytes at {:p}",
      count.saturating_mul(size_of::<T>()),
      ptr
    );
    self.arena.borrow_mut().give(ptr.as_ptr().cast());
  }
}

impl<T> Clone for ArenaAllocator<T> {
  fn clone(&self) -> Self {
    Self { arena: Rc::clone(&self.arena), _elem: PhantomData }
  }
}

impl<T> PartialEq for ArenaAllocator<T> {
  /// Arena identity: adapters over the same arena are interchangeable.
  fn eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.arena, &other.arena)
  }
}

impl<T> Eq for ArenaAllocator<T> {}

/// Pass-through adapter over the system allocator with the same surface.
/// Comparison baseline only; all instances are interchangeable.
#[derive(Debug)]
pub struct SystemAllocator<T> {
  _elem: PhantomData<T>,
}

impl<T> SystemAllocator<T> {
  pub fn new() -> Self {
    Self { _elem: PhantomData }
  }

  pub fn allocate(&self, count: usize) -> NonNull<T> {
    let Ok(layout) = Layout::array::<T>(count) else {
      handle_alloc_error(Layout::new::<T>())
    };
    if layout.size() == 0 {
      return NonNull::dangling();
    }
    let Some(ptr) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
      handle_alloc_error(layout)
    };
    log::debug!("system allocated {} bytes at {:p}", layout.size(), ptr);
    ptr.cast()
  }

  pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
    if let Ok(layout) = Layout::array::<T>(count) {
      if layout.size() > 0 {
        log::debug!("system freed {} bytes at {:p}", layout.size(), ptr);
        unsafe { alloc::dealloc(ptr.as_ptr().cast(), layout) };
      }
    }
  }
}

impl<T> Default for SystemAllocator<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for SystemAllocator<T> {
  fn clone(&self) -> Self {
    Self::new()
  }
}

impl<T> PartialEq for SystemAllocator<T> {
  fn eq(&self, _other: &Self) -> bool {
    true
  }
}

impl<T> Eq for SystemAllocator<T> {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  fn arena(len: usize) -> BuddyArena {
    BuddyArena::new(len).unwrap()
  }

  /// Offset of a returned pointer relative to the usable base.
  fn offset_of(tree: &BuddyArena, ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize - (tree.mem() as usize + tree.base_ofs)
  }

  /// Per-class sets of free leaf indices.
  fn snapshot(tree: &BuddyArena) -> Vec<Vec<usize>> {
    (0..tree.layers)
      .map(|class| {
        (0..tree.class_blocks(class))
          .filter(|&index| tree.bit(class, class, index))
          .collect()
      })
      .collect()
  }

  /// Free-list walk length must equal the count of queued state bytes, per
  /// class, and every listed node must carry the queued marker.
  fn assert_consistent(tree: &BuddyArena) {
    for class in 0..tree.layers {
      let queued = (0..tree.segments)
        .filter(|&seg| tree.state(seg) == BuddyArena::queued(class))
        .count();
      let mut walked = 0;
      let mut index = tree.head(class);
      while index >= 0 {
        assert!(walked <= tree.segments, "class {class} list cycles");
        let seg = tree.segment_of(class, index as usize);
        assert_eq!(tree.state(seg), BuddyArena::queued(class));
        walked += 1;
        index = tree.node(class, index as usize).next;
      }
      assert_eq!(walked, queued, "class {class} list disagrees with state bytes");
    }
  }

  thread_local! {
    static EVENTS: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
  }

  fn record(event: TraceEvent) {
    EVENTS.with(|events| events.borrow_mut().push(event));
  }

  fn drain_events() -> Vec<TraceEvent> {
    EVENTS.with(|events| events.borrow_mut().drain(..).collect())
  }

  // --- geometry ---

  #[test]
  fn layer_count_by_round_up_halving() {
    assert_eq!(layer_count(16), 1);
    assert_eq!(layer_count(17), 2);
    assert_eq!(layer_count(1000), 7);
    assert_eq!(layer_count(16 * 1024), 11);
    assert_eq!(layer_count(16 * 1024 + 1), 12);
  }

  #[test]
  fn block_sizes_halve_per_class() {
    assert_eq!(block_size_for(11, 0), 16 * 1024);
    assert_eq!(block_size_for(11, 1), 8 * 1024);
    assert_eq!(block_size_for(11, 10), MINIMUM);
    for class in 0..10 {
      assert_eq!(block_size_for(11, class), 2 * block_size_for(11, class + 1));
    }
  }

  #[test]
  fn layer_widths_are_even_padded() {
    assert_eq!(layer_bits(16 * 1024, 11, 0), 2);
    assert_eq!(layer_bits(16 * 1024, 11, 10), 1024);
    assert_eq!(layer_words(16 * 1024, 11, 10), 16);
    // 3 raw nodes pad to 4
    assert_eq!(layer_bits(48, 2, 1), 4);
  }

  #[test]
  fn align_up_rounds_to_boundary() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(17, 16), 32);
  }

  #[test]
  fn class_selection_is_finest_fit() {
    let tree = arena(16 * 1024);
    let finest = tree.layers - 1;
    assert_eq!(tree.class_for(0), Some(finest));
    assert_eq!(tree.class_for(16), Some(finest));
    assert_eq!(tree.class_for(17), Some(finest - 1));
    assert_eq!(tree.class_for(4096), Some(2));
    assert_eq!(tree.class_for(16 * 1024), Some(0));
    assert_eq!(tree.class_for(16 * 1024 + 1), None);
  }

  // --- construction ---

  #[test]
  fn construction_rejects_tiny_regions() {
    assert!(matches!(
      BuddyArena::new(MINIMUM),
      Err(ArenaError::RegionTooSmall { .. })
    ));
    assert!(BuddyArena::new(4096).is_ok());
  }

  #[test]
  fn seeding_covers_usable_capacity() {
    for len in [4096, 16 * 1024, 14_000, 1 << 20] {
      let tree = arena(len);
      let seeded: usize = (0..tree.layers)
        .map(|class| tree.free_count(class) * tree.block_size(class))
        .sum();
      assert_eq!(seeded, tree.capacity(), "len {len}");
      assert_consistent(&tree);
    }
  }

  // --- orchestrator scenarios ---

  #[test]
  fn scenario_16k_page_class() {
    let mut tree = arena(16 * 1024);

    let first = tree.take(4000).unwrap();
    assert_eq!(offset_of(&tree, first) % 4096, 0);

    let second = tree.take(4000).unwrap();
    assert_ne!(first, second);
    let gap = offset_of(&tree, first).abs_diff(offset_of(&tree, second));
    assert!(gap >= 4096, "allocations overlap");

    tree.give(first.as_ptr());
    let third = tree.take(4000).unwrap();
    assert_eq!(third, first, "freed block not reused from the list");
  }

  #[test]
  fn oversized_take_returns_none() {
    let mut tree = arena(16 * 1024);
    assert!(tree.take(16 * 1024 + 1).is_none());
    assert!(tree.take(usize::MAX).is_none());
  }

  #[test]
  fn exhaustion_returns_none_not_panic() {
    let mut tree = arena(4096);
    // The coarsest class is sized for the whole mapping; metadata overhead
    // makes it unobtainable even though class selection accepts it.
    assert!(tree.capacity() < tree.block_size(0));
    assert!(tree.take(tree.block_size(0)).is_none());
  }

  #[test]
  fn round_trip_restores_availability() {
    let mut tree = arena(16 * 1024);
    let before = snapshot(&tree);
    for size in [1, 16, 100, 4000] {
      let ptr = tree.take(size).unwrap();
      tree.give(ptr.as_ptr());
      assert_eq!(snapshot(&tree), before, "take({size}) not reversible");
      assert_consistent(&tree);
    }
  }

  #[test]
  fn returned_blocks_are_class_aligned() {
    let mut tree = arena(64 * 1024);
    for size in [16, 64, 1024, 4096] {
      let ptr = tree.take(size).unwrap();
      let offset = offset_of(&tree, ptr);
      let class = (tree.state(offset / MINIMUM) - 1) as usize;
      assert_eq!(tree.block_size(class), size);
      assert_eq!(offset % tree.block_size(class), 0);
    }
  }

  #[test]
  fn full_capacity_in_minimum_blocks() {
    let mut tree = arena(16 * 1024);
    let mut blocks = Vec::new();
    while let Some(ptr) = tree.take(1) {
      blocks.push(ptr);
    }
    assert_eq!(blocks.len(), tree.segments());

    let mut offsets: Vec<usize> = blocks.iter().map(|&p| offset_of(&tree, p)).collect();
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), blocks.len(), "duplicate block handed out");

    for ptr in &blocks {
      tree.give(ptr.as_ptr());
    }
    assert_consistent(&tree);
    assert!(tree.take(1).is_some());
  }

  #[test]
  fn checkerboard_free_only_merges_buddies() {
    let mut tree = arena(8 * 1024);
    let initial = snapshot(&tree);
    let finest = tree.layers - 1;

    let mut blocks = Vec::new();
    while let Some(ptr) = tree.take(1) {
      blocks.push(ptr);
    }
    blocks.sort_by_key(|&ptr| offset_of(&tree, ptr));

    // Every other block: adjacent free minimums are never buddies, so no
    // pair may coalesce.
    for pair in blocks.chunks(2) {
      tree.give(pair[0].as_ptr());
    }
    let freed = blocks.len().div_ceil(2);
    assert_eq!(tree.free_count(finest), freed);
    for class in 0..finest {
      assert_eq!(tree.free_count(class), 0, "class {class} coalesced early");
    }
    assert_consistent(&tree);

    // Freeing the rest completes every buddy pair and the arena collapses
    // back to its seeded blocks.
    for pair in blocks.chunks(2) {
      if let [_, odd] = pair {
        tree.give(odd.as_ptr());
      }
    }
    assert_eq!(snapshot(&tree), initial);
    assert_consistent(&tree);
  }

  #[test]
  fn coalescing_is_order_independent() {
    let run = |first: usize, second: usize| {
      let mut tree = arena(16 * 1024);
      let before = snapshot(&tree);
      let finest = tree.layers - 1;
      let blocks: Vec<_> = (0..4).map(|_| tree.take(16).unwrap()).collect();
      let offsets: Vec<_> = blocks.iter().map(|&ptr| offset_of(&tree, ptr)).collect();

      // Find a buddy pair among the four minimum blocks.
      let (a, b) = (0..4)
        .flat_map(|i| (i + 1..4).map(move |j| (i, j)))
        .find(|&(i, j)| offsets[i] ^ MINIMUM == offsets[j])
        .expect("no buddy pair among four minimum blocks");
      let pair = [a, b];

      tree.give(blocks[pair[first]].as_ptr());
      tree.give(blocks[pair[second]].as_ptr());

      // Exactly one merged parent, never two stray children.
      assert!(!tree.bit(finest, finest, offsets[a] / MINIMUM));
      assert!(!tree.bit(finest, finest, offsets[b] / MINIMUM));
      assert_consistent(&tree);

      for i in 0..4 {
        if i != a && i != b {
          tree.give(blocks[i].as_ptr());
        }
      }
      assert_eq!(snapshot(&tree), before);
      snapshot(&tree)
    };

    assert_eq!(run(0, 1), run(1, 0));
  }

  // --- misuse and corruption ---

  #[test]
  fn invalid_and_double_frees_are_reported_noops() {
    let mut tree = BuddyArena::with_trace(16 * 1024, record).unwrap();
    drain_events();

    tree.give(ptr::null_mut());
    assert!(drain_events().is_empty(), "null free is silent");

    // The metadata prefix is not a block.
    tree.give(tree.mem());
    assert!(matches!(
      drain_events().as_slice(),
      [TraceEvent::InvalidFree { .. }]
    ));

    let ptr = tree.take(100).unwrap();
    tree.give(ptr.as_ptr());
    let before = snapshot(&tree);
    drain_events();

    tree.give(ptr.as_ptr());
    assert!(
      drain_events()
        .iter()
        .any(|event| matches!(event, TraceEvent::InvalidFree { .. }))
    );
    assert_eq!(snapshot(&tree), before, "double free mutated state");
    assert_consistent(&tree);
  }

  #[test]
  fn corrupted_head_heals_and_reports() {
    let mut tree = BuddyArena::with_trace(16 * 1024, record).unwrap();
    let finest = tree.layers - 1;

    // Hold enough minimum blocks that the freed one is the only free leaf
    // in its class, then queue it.
    let queued = tree.take(16).unwrap();
    let _held_a = tree.take(16).unwrap();
    let _held_b = tree.take(16).unwrap();
    tree.give(queued.as_ptr());
    assert!(tree.head(finest) >= 0);
    drain_events();

    // Simulate an aliased top-of-stack entry: the queued marker vanishes.
    let seg = offset_of(&tree, queued) / MINIMUM;
    tree.set_state(seg, 0);

    // The list self-heals to empty; the tree walk still finds the block.
    let ptr = tree.take(16).unwrap();
    assert_eq!(ptr, queued);
    assert_eq!(tree.head(finest), NONE);
    assert_eq!(tree.tail(finest), NONE);
    assert!(
      drain_events()
        .iter()
        .any(|event| matches!(event, TraceEvent::CorruptHead { .. }))
    );
  }

  // --- stress ---

  #[test]
  fn random_take_give_never_overlaps() {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    let mut rng = StdRng::seed_from_u64(0xCA90_59EE);
    let mut tree = arena(64 * 1024);
    let initial = snapshot(&tree);
    let mut live: Vec<(usize, usize, NonNull<u8>)> = Vec::new();

    for _ in 0..10_000 {
      if live.is_empty() || rng.gen_bool(0.55) {
        let size = rng.gen_range(1..=2048);
        if let Some(ptr) = tree.take(size) {
          let offset = offset_of(&tree, ptr);
          let class = (tree.state(offset / MINIMUM) - 1) as usize;
          let bytes = tree.block_size(class);
          assert!(bytes >= size);
          for &(other, other_bytes, _) in &live {
            assert!(
              offset + bytes <= other || other + other_bytes <= offset,
              "live allocations overlap"
            );
          }
          live.push((offset, bytes, ptr));
        }
      } else {
        let victim = rng.gen_range(0..live.len());
        let (_, _, ptr) = live.swap_remove(victim);
        tree.give(ptr.as_ptr());
      }
    }

    for (_, _, ptr) in live.drain(..) {
      tree.give(ptr.as_ptr());
    }
    assert_consistent(&tree);
    assert_eq!(snapshot(&tree), initial, "full drain did not restore seeding");
  }

  // --- adapters ---

  #[test]
  fn arena_adapter_round_trips_typed_blocks() {
    let shared = Rc::new(RefCell::new(arena(16 * 1024)));
    let adapter = ArenaAllocator::<u32>::new(Rc::clone(&shared));

    let ptr = adapter.allocate(8);
    unsafe {
      for i in 0..8 {
        ptr.as_ptr().add(i).write(i as u32 * 3);
      }
      for i in 0..8 {
        assert_eq!(ptr.as_ptr().add(i).read(), i as u32 * 3);
      }
      adapter.deallocate(ptr, 8);
    }

    let again = adapter.allocate(8);
    assert_eq!(again, ptr, "same-class block not reused");
    unsafe { adapter.deallocate(again, 8) };
  }

  #[test]
  fn adapter_equality_is_arena_identity() {
    let shared = Rc::new(RefCell::new(arena(4096)));
    let left = ArenaAllocator::<u64>::new(Rc::clone(&shared));
    let right = left.clone();
    assert_eq!(left, right);

    let other = ArenaAllocator::<u64>::new(Rc::new(RefCell::new(arena(4096))));
    assert_ne!(left, other);

    assert_eq!(SystemAllocator::<u64>::new(), SystemAllocator::<u64>::new());
  }

  #[test]
  fn system_adapter_round_trips() {
    let adapter = SystemAllocator::<u64>::new();
    let ptr = adapter.allocate(4);
    unsafe {
      for i in 0..4 {
        ptr.as_ptr().add(i).write(u64::MAX - i as u64);
      }
      assert_eq!(ptr.as_ptr().read(), u64::MAX);
      adapter.deallocate(ptr, 4);
    }
  }

  #[test]
  fn debug_dump_renders() {
    let mut tree = arena(4096);
    let ptr = tree.take(64).unwrap();
    let dump = format!("{tree:?}");
    assert!(dump.contains("BuddyArena"));
    assert!(dump.contains("allocated:"));
    let verbose = format!("{tree:#?}");
    assert!(verbose.len() >= dump.len());
    tree.give(ptr.as_ptr());
  }
}
