use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use super::download::Torrent;
use super::State;
use crate::constants::{BLOCK_SIZE, RESPONSE_HEAP_SPILL, SPILL_RUN_BLOCKS};
use crate::peer::Block;

/// A buffered block keyed by its torrent-wide block id, so the heap pops
/// blocks in `(piece, offset)` order.
struct HeapBlock {
    id: u32,
    block: Block,
}

impl PartialEq for HeapBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HeapBlock {}

impl Ord for HeapBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for HeapBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Blocks waiting to be merged into piece-sized (or run-sized) writes.
struct ResponseHeap {
    heap: BinaryHeap<Reverse<HeapBlock>>,
    buffered: HashSet<u32>,
}

impl ResponseHeap {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            buffered: HashSet::new(),
        }
    }

    fn push(&mut self, id: u32, block: Block) {
        // Endgame can deliver the same block from two peers.
        if self.buffered.insert(id) {
            self.heap.push(Reverse(HeapBlock { id, block }));
        }
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn pop(&mut self) -> Option<HeapBlock> {
        let Reverse(entry) = self.heap.pop()?;
        self.buffered.remove(&entry.id);
        Some(entry)
    }

    fn peek_id(&self) -> Option<u32> {
        self.heap.peek().map(|Reverse(entry)| entry.id)
    }

    /// Removes every buffered block of one piece.
    fn take_piece(&mut self, index: u32) -> Vec<Block> {
        let mut rest = BinaryHeap::with_capacity(self.heap.len());
        let mut taken = Vec::new();
        for Reverse(entry) in std::mem::take(&mut self.heap).into_vec() {
            if entry.block.index == index {
                self.buffered.remove(&entry.id);
                taken.push(entry.block);
            } else {
                rest.push(Reverse(entry));
            }
        }
        self.heap = rest;
        taken.sort_by_key(|b| b.begin);
        taken
    }

    fn holds_any_of_piece(&self, index: u32, blocks: u32, stride: u32) -> bool {
        let start = index * stride;
        (0..blocks).any(|b| self.buffered.contains(&(start + b)))
    }

    /// `true` when every block of the piece is buffered, so the batched
    /// merge can write it contiguously.
    fn piece_complete(&self, index: u32, blocks: u32, stride: u32) -> bool {
        let start = index * stride;
        (0..blocks).all(|b| self.buffered.contains(&(start + b)))
    }
}

impl Torrent {
    /// Consumes delivered blocks, merges them into large writes and
    /// schedules verification as pieces complete.
    pub(super) async fn assembler_loop(self: Arc<Self>) {
        let Some(mut rx) = self.res_rx.lock().await.take() else {
            return;
        };
        let mut heap = ResponseHeap::new();

        loop {
            let block = tokio::select! {
                _ = self.cancel_token().cancelled() => return,
                block = rx.recv() => match block {
                    Some(block) => block,
                    None => return,
                },
            };

            if !self.state().matches(State::DOWNLOADING) {
                continue;
            }
            self.accept_block(&mut heap, block).await;
        }
    }

    async fn accept_block(self: &Arc<Self>, heap: &mut ResponseHeap, block: Block) {
        let n = block.data.len();
        self.io_down.record(n);
        self.net_down.record(n);
        self.shared.io_down.record(n);
        self.downloaded.fetch_add(n as u64, Ordering::Relaxed);

        // Duplicate delivery after completion (endgame) is dropped.
        if self.have_contains(block.index) {
            return;
        }

        if self.endgame.load(Ordering::Relaxed) {
            self.write_block_now(block).await;
            return;
        }

        let id = self.block_id(block.index, block.begin);
        let index = block.index;
        self.chunk_map.lock().set(id);
        heap.push(id, block);

        if heap.len() < RESPONSE_HEAP_SPILL {
            let info = self.info();
            if heap.piece_complete(index, info.blocks_in_piece(index), info.blocks_per_piece()) {
                self.merge_piece(heap, index).await;
            }
        } else {
            self.spill_run(heap).await;
        }
    }

    /// Endgame path: no buffering, every block goes straight to disk.
    async fn write_block_now(self: &Arc<Self>, block: Block) {
        let offset = block.index as u64 * self.info().piece_length + block.begin as u64;
        let index = block.index;
        let id = self.block_id(block.index, block.begin);

        if let Err(err) = self.write_range(offset, &block.data).await {
            self.set_error(err);
            return;
        }
        self.chunk_map.lock().set(id);

        if self.piece_blocks_done(index) {
            self.spawn_verify(index);
        }
    }

    /// Batched merge: all blocks of `index` are buffered, so write the
    /// whole piece in one pass and verify it.
    async fn merge_piece(self: &Arc<Self>, heap: &mut ResponseHeap, index: u32) {
        let blocks = heap.take_piece(index);
        if blocks.is_empty() {
            return;
        }

        let mut buf = Vec::with_capacity(self.info().piece_len(index) as usize);
        for block in &blocks {
            buf.extend_from_slice(&block.data);
        }

        trace!(info_hash = %self.info().hash, piece = index, "merging piece");
        if let Err(err) = self
            .write_range(index as u64 * self.info().piece_length, &buf)
            .await
        {
            self.set_error(err);
            return;
        }

        self.spawn_verify(index);
    }

    /// Spill merge: the heap is full, so write the smallest contiguous
    /// run (bounded) and verify any piece it completed on disk.
    async fn spill_run(self: &Arc<Self>, heap: &mut ResponseHeap) {
        let Some(head) = heap.pop() else {
            return;
        };

        let head_piece = head.block.index;
        let start_offset =
            head.block.index as u64 * self.info().piece_length + head.block.begin as u64;
        let mut tail_id = head.id;
        let mut tail_piece = head_piece;
        let mut buf = Vec::with_capacity((SPILL_RUN_BLOCKS * BLOCK_SIZE) as usize);
        buf.extend_from_slice(&head.block.data);

        while let Some(next_id) = heap.peek_id() {
            if next_id != tail_id + 1 || tail_id - head.id >= SPILL_RUN_BLOCKS - 1 {
                break;
            }
            let Some(entry) = heap.pop() else {
                break;
            };
            tail_id = entry.id;
            tail_piece = entry.block.index;
            buf.extend_from_slice(&entry.block.data);
        }

        if let Err(err) = self.write_range(start_offset, &buf).await {
            self.set_error(err);
            return;
        }

        let stride = self.info().blocks_per_piece();
        for index in head_piece..=tail_piece {
            if self.piece_blocks_done(index)
                && !heap.holds_any_of_piece(index, self.info().blocks_in_piece(index), stride)
            {
                self.spawn_verify(index);
            }
        }
    }

    pub(super) fn spawn_verify(self: &Arc<Self>, index: u32) {
        let torrent = self.clone();
        tokio::spawn(async move {
            if let Err(err) = torrent.verify_piece(index).await {
                torrent.set_error(err);
            }
        });
    }
}
