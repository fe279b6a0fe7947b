//! The filesystem engine: in-memory tables, block allocation and replay.
//!
//! Every mutating operation appends one or more tagged blocks through the
//! attached container and mirrors the change in two tables. Mounting without
//! formatting replays the container in sequence order to rebuild the same
//! tables.

pub mod record;

use crate::error::{Error, Result};
use crate::io::BlockIo;
use crate::table::{INDEX_PRIMARY, Table};
use rand_core::{OsRng, RngCore};
use record::{
    BlockRecord, DATA_SIZE, DataHead, NAME_MAX, NODE_SIZE, Name, NodeKind, NodeRecord, OP_LAST,
    OVERHEAD_SIZE, Op, TAG_SIZE, Tag,
};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Secondary index id in both tables.
const INDEX_LOOKUP: usize = 1;

/// Block size of a detached engine.
const DETACHED_BLOCK_SIZE: usize = 64;

/// A block position paired with its tag, collected during the scan.
#[derive(Clone, Copy)]
struct TaggedBlock {
    block: u64,
    tag: Tag,
}

/// Capacity summary of a mounted engine.
pub struct Status {
    pub block_size: usize,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub name_max: usize,
}

/// Attributes of a resolved node.
pub struct Stat {
    pub node: u32,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u16,
    pub atime: u64,
    pub mtime: u64,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn op_filter(op: Op) -> impl Fn(&BlockRecord) -> Ordering {
    move |b| b.op.cmp(&op)
}

/// The append-oriented filesystem over one container.
pub struct AppendFs {
    next_node_id: u32,
    next_seq_id: u64,
    next_block_id: u64,
    first_block_id: u64,
    last_block_id: u64,
    block_size: usize,
    payload_size: usize,
    /// Mount time, reported for the synthetic root.
    time: u64,
    nodes: Table<NodeRecord>,
    blocks: Table<BlockRecord>,
    io: Option<BlockIo>,
}

impl AppendFs {
    /// Mounts the engine over `io`, replaying the container or formatting it
    /// first.
    pub fn new(io: BlockIo, format: bool) -> Result<Self> {
        let mut fs = Self::build(Some(io))?;
        if format {
            fs.format()?;
        } else {
            fs.load()?;
        }
        fs.time = now();
        Ok(fs)
    }

    /// An engine without a backing container; nothing is persisted.
    pub fn detached() -> Result<Self> {
        let mut fs = Self::build(None)?;
        fs.time = now();
        Ok(fs)
    }

    fn build(io: Option<BlockIo>) -> Result<Self> {
        let (first_block_id, last_block_id, block_size) = match &io {
            Some(io) => (io.block_first(), io.block_last(), io.block_size()),
            // Second largest id, so the tail allocator never wraps.
            None => (crate::io::BLOCK_FIRST, u64::MAX - 1, DETACHED_BLOCK_SIZE),
        };
        if block_size < OVERHEAD_SIZE {
            return Err(Error::Invalid);
        }
        let mut nodes = Table::new(record::node_cmp_primary);
        nodes.add_index(record::node_cmp_lookup)?;
        let mut blocks = Table::new(record::block_cmp_primary);
        blocks.add_index(record::block_cmp_lookup)?;
        Ok(Self {
            next_node_id: 1,
            next_seq_id: 1,
            next_block_id: first_block_id,
            first_block_id,
            last_block_id,
            block_size,
            payload_size: block_size - OVERHEAD_SIZE,
            time: 0,
            nodes,
            blocks,
            io,
        })
    }

    /// Releases the backing container.
    pub fn into_io(self) -> Option<BlockIo> {
        self.io
    }

    /// Flushes the container.
    pub fn sync(&mut self) -> Result<()> {
        match &mut self.io {
            Some(io) => io.sync(),
            None => Ok(()),
        }
    }

    // Allocation

    /// Picks a block to overwrite for a new block of `op` owned by `node`.
    fn reuse_block(&self, op: Op, node: u32) -> Result<u64> {
        if let Ok(found) = self.blocks.first(INDEX_LOOKUP, op_filter(Op::Free)) {
            return Ok(found.block);
        }
        // Delete blocks keep information a replay can use; they are
        // sacrificed only once no free block remains.
        if let Ok(found) = self.blocks.first(INDEX_LOOKUP, op_filter(Op::Delete)) {
            return Ok(found.block);
        }
        if node < 1 {
            return Err(Error::NoSpace);
        }
        // Same-node takeover, restricted to the same operation code.
        match self.blocks.first(INDEX_LOOKUP, move |b: &BlockRecord| {
            b.op.cmp(&op).then(b.node.cmp(&node))
        }) {
            Ok(found) => Ok(found.block),
            Err(Error::NotFound) => Err(Error::NoSpace),
            Err(e) => Err(e),
        }
    }

    /// Allocates, stamps and registers a block record.
    fn create_block(&mut self, op: Op, node: u32, fill: u16, offset: u64) -> Result<BlockRecord> {
        let block = if self.next_block_id <= self.last_block_id {
            let id = self.next_block_id;
            self.next_block_id += 1;
            id
        } else {
            self.reuse_block(op, node)?
        };
        let seq = self.next_seq_id;
        self.next_seq_id += 1;
        let entry = BlockRecord {
            block,
            seq,
            op,
            node,
            fill,
            offset,
        };
        self.record_block(entry)?;
        Ok(entry)
    }

    /// Registers `entry`, replacing any previous record at its block id.
    fn record_block(&mut self, entry: BlockRecord) -> Result<()> {
        if entry.node >= self.next_node_id {
            self.next_node_id = entry.node + 1;
        }
        self.blocks.insert_or_replace(entry)
    }

    /// Persists a block whose payload is a node record.
    fn write_node_block(&mut self, block: &BlockRecord, payload: &NodeRecord) -> Result<()> {
        let Some(io) = &mut self.io else {
            return Ok(());
        };
        io.write3(
            block.block,
            &block.tag().encode(),
            &block.head().encode(),
            &payload.encode(),
        )
    }

    // Resolution

    fn root(&self) -> NodeRecord {
        NodeRecord {
            node: 0,
            parent: 0,
            kind: NodeKind::Dir,
            atime: self.time,
            mtime: self.time,
            mode: 0,
            name: Name::empty(),
        }
    }

    /// Walks `path` component by component through the lookup index.
    fn resolve_node(&self, path: &str) -> Result<NodeRecord> {
        let mut current = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if current.kind != NodeKind::Dir {
                return Err(Error::Invalid);
            }
            let name = Name::new(part)?;
            let parent = current.node;
            current = self.nodes.first(INDEX_LOOKUP, move |n: &NodeRecord| {
                n.parent.cmp(&parent).then_with(|| n.name.cmp(&name))
            })?;
        }
        Ok(current)
    }

    /// Splits `path` into its parent directory and final name.
    fn split_path(path: &str) -> (&str, &str) {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
            None => (".", trimmed),
        }
    }

    /// Reserves an id and builds the row for a new node at `path`.
    fn init_node(&mut self, path: &str, kind: NodeKind) -> Result<NodeRecord> {
        match self.resolve_node(path) {
            Ok(_) => return Err(Error::Exists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        let (dir, base) = Self::split_path(path);
        let parent = self.resolve_node(dir)?;
        if parent.kind != NodeKind::Dir {
            return Err(Error::Invalid);
        }
        let name = Name::new(base)?;
        let stamp = now();
        let node = self.next_node_id;
        self.next_node_id += 1;
        Ok(NodeRecord {
            node,
            parent: parent.node,
            kind,
            atime: stamp,
            mtime: stamp,
            mode: 0,
            name,
        })
    }

    /// Drops every row of `node`, undoing a creation whose block allocation
    /// failed.
    fn rollback_node(&mut self, node: u32) {
        let _ = self
            .nodes
            .delete(INDEX_PRIMARY, move |n: &NodeRecord| n.node.cmp(&node));
    }

    // Create

    /// Creates a regular file at `path`.
    pub fn set_file(&mut self, path: &str) -> Result<()> {
        self.set_node(path, NodeKind::File)
    }

    /// Creates a directory at `path`.
    pub fn set_dir(&mut self, path: &str) -> Result<()> {
        self.set_node(path, NodeKind::Dir)
    }

    fn set_node(&mut self, path: &str, kind: NodeKind) -> Result<()> {
        let entry = self.init_node(path, kind)?;
        self.nodes.insert_or_replace(entry)?;
        let block = match self.create_block(Op::Node, entry.node, 0, 0) {
            Ok(block) => block,
            Err(e) => {
                self.rollback_node(entry.node);
                return Err(e);
            }
        };
        self.write_node_block(&block, &entry)
    }

    /// Creates a symbolic link at `from` pointing to `to`.
    ///
    /// The link and its target string are two rows and two blocks sharing
    /// one node id; a crash between the two writes leaves a dangling link
    /// whose target reads as missing.
    pub fn set_link(&mut self, from: &str, to: &str) -> Result<()> {
        if to.len() > NAME_MAX {
            return Err(Error::Invalid);
        }
        let entry = self.init_node(from, NodeKind::Link)?;
        self.nodes.insert_or_replace(entry)?;
        let payload = NodeRecord {
            node: entry.node,
            parent: entry.node,
            kind: NodeKind::LinkPayload,
            atime: 0,
            mtime: 0,
            mode: 0,
            name: Name::new(to)?,
        };
        self.nodes.insert_or_replace(payload)?;
        for part in [&entry, &payload] {
            let block = match self.create_block(Op::Node, part.node, 0, 0) {
                Ok(block) => block,
                Err(e) => {
                    self.rollback_node(entry.node);
                    return Err(e);
                }
            };
            self.write_node_block(&block, part)?;
        }
        Ok(())
    }

    // Update

    /// Updates a node's timestamps.
    pub fn set_time(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        let mut node = self.resolve_node(path)?;
        // Access-only updates are not worth a block.
        if mtime == node.mtime || node.node == 0 {
            return Ok(());
        }
        node.atime = atime;
        node.mtime = mtime;
        self.upsert_node(node)
    }

    /// Stores mode bits on a node. They are recorded, never enforced.
    pub fn set_mode(&mut self, path: &str, mode: u16) -> Result<()> {
        let mut node = self.resolve_node(path)?;
        if mode == node.mode || node.node == 0 {
            return Ok(());
        }
        node.mode = mode;
        self.upsert_node(node)
    }

    fn upsert_node(&mut self, node: NodeRecord) -> Result<()> {
        self.nodes.insert_or_replace(node)?;
        let block = self.create_block(Op::Node, node.node, 0, 0)?;
        self.write_node_block(&block, &node)
    }

    /// Writes `data` at `offset`, splitting it into payload-sized blocks.
    pub fn set_data(&mut self, node: u32, data: &[u8], offset: u64) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let amount = (data.len() - written).min(self.payload_size);
            let block = self.create_block(Op::Data, node, amount as u16, offset + written as u64)?;
            if let Some(io) = &mut self.io {
                io.write3(
                    block.block,
                    &block.tag().encode(),
                    &block.head().encode(),
                    &data[written..written + amount],
                )?;
            }
            written += amount;
        }
        Ok(())
    }

    // Query

    /// Summarizes capacity. Free blocks are the unused tail plus every FREE
    /// and DELETE record.
    pub fn get_status(&self) -> Result<Status> {
        let unused = self.last_block_id + 1 - self.next_block_id;
        let free = self.blocks.count(INDEX_LOOKUP, op_filter(Op::Free))? as u64;
        let deleted = self.blocks.count(INDEX_LOOKUP, op_filter(Op::Delete))? as u64;
        Ok(Status {
            block_size: self.block_size,
            total_blocks: self.last_block_id - self.first_block_id + 1,
            free_blocks: unused + free + deleted,
            name_max: NAME_MAX,
        })
    }

    /// Stats the node at `path`.
    pub fn get_node(&self, path: &str) -> Result<Stat> {
        let node = self.resolve_node(path)?;
        let size = match node.kind {
            NodeKind::File => {
                let id = node.node;
                match self.blocks.last(INDEX_LOOKUP, move |b: &BlockRecord| {
                    b.op.cmp(&Op::Data).then(b.node.cmp(&id))
                }) {
                    Ok(last) => last.offset + last.fill as u64,
                    Err(Error::NotFound) => 0,
                    Err(e) => return Err(e),
                }
            }
            NodeKind::Link => self.link_payload(node.node)?.name.len() as u64,
            _ => 0,
        };
        Ok(Stat {
            node: node.node,
            kind: node.kind,
            size,
            mode: node.mode,
            atime: node.atime,
            mtime: node.mtime,
        })
    }

    /// Visits every child of the directory at `path`, ordered by name.
    pub fn get_dir<C>(&self, path: &str, each: C) -> Result<()>
    where
        C: FnMut(&NodeRecord),
    {
        let dir = self.resolve_node(path)?;
        if dir.kind != NodeKind::Dir {
            return Err(Error::Invalid);
        }
        let parent = dir.node;
        match self.nodes.each(
            INDEX_LOOKUP,
            move |n: &NodeRecord| n.parent.cmp(&parent),
            each,
        ) {
            Err(Error::NotFound) => Ok(()),
            other => other,
        }
    }

    fn link_payload(&self, node: u32) -> Result<NodeRecord> {
        self.nodes.first(INDEX_PRIMARY, move |n: &NodeRecord| {
            n.node
                .cmp(&node)
                .then(n.kind.cmp(&NodeKind::LinkPayload))
        })
    }

    /// Returns the payload row of the link at `path`; its name is the
    /// target string.
    pub fn get_link(&self, path: &str) -> Result<NodeRecord> {
        let node = self.resolve_node(path)?;
        if node.kind != NodeKind::Link {
            return Err(Error::Invalid);
        }
        self.link_payload(node.node)
    }

    /// Reads up to `data.len()` bytes at `offset`, layering DATA blocks in
    /// sequence order. Returns the number of bytes produced; zero is EOF.
    pub fn get_data(&self, node: u32, data: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0usize;
        while total < data.len() {
            let limit = (data.len() - total).min(self.payload_size);
            let read = match self.get_data_window(
                node,
                &mut data[total..total + limit],
                offset + total as u64,
            ) {
                Ok(read) => read,
                Err(Error::NotFound) => 0,
                Err(e) => return Err(e),
            };
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    /// Overlays every DATA block intersecting one window of a read.
    fn get_data_window(&self, node: u32, data: &mut [u8], offset: u64) -> Result<usize> {
        let size = data.len() as u64;
        let payload_size = self.payload_size as u64;
        // The filter is deliberately broad: the lookup index orders by
        // (offset, fill), so it admits everything that could intersect and
        // the exact test runs per block below.
        let filter = move |b: &BlockRecord| {
            let group = b.op.cmp(&Op::Data).then(b.node.cmp(&node));
            if group != Ordering::Equal {
                return group;
            }
            if b.offset >= offset + size {
                return Ordering::Greater;
            }
            if b.offset + payload_size <= offset {
                return Ordering::Less;
            }
            Ordering::Equal
        };
        let mut filled = 0usize;
        let mut failure = None;
        self.blocks
            .each_ordered(INDEX_LOOKUP, filter, record::block_cmp_seq, |b| {
                if failure.is_some() {
                    return;
                }
                let src_start = b.offset;
                let src_end = b.offset + b.fill as u64;
                if src_start >= offset + size || src_end <= offset {
                    return;
                }
                let skip = src_start.max(offset) - src_start;
                let seek = src_start.max(offset) - offset;
                let amount = (src_end.min(offset + size) - src_start.max(offset)) as usize;
                if amount == 0 {
                    return;
                }
                if let Some(io) = &self.io {
                    let dest = &mut data[seek as usize..seek as usize + amount];
                    if let Err(e) = io.read_slice(b.block, OVERHEAD_SIZE + skip as usize, dest) {
                        failure = Some(e);
                        return;
                    }
                }
                if skip as usize + amount > filled {
                    filled = skip as usize + amount;
                }
            })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(filled.min(data.len())),
        }
    }

    // Move

    /// Applies an updated row unless a conflicting node occupies its place.
    fn apply_move(&mut self, node: NodeRecord) -> Result<()> {
        match self.nodes.first(INDEX_LOOKUP, move |n: &NodeRecord| {
            n.parent
                .cmp(&node.parent)
                .then_with(|| n.name.cmp(&node.name))
        }) {
            Ok(existing) => {
                if existing.kind == NodeKind::File {
                    Err(Error::Exists)
                } else {
                    // Moving onto a directory or link is not supported.
                    Err(Error::Invalid)
                }
            }
            Err(Error::NotFound) => self.nodes.insert_or_replace(node),
            Err(e) => Err(e),
        }
    }

    /// Renames or moves the node at `from` to `to`. An existing file at the
    /// destination is overwritten.
    pub fn move_node(&mut self, from: &str, to: &str) -> Result<()> {
        let mut node = self.resolve_node(from)?;
        let (dir, base) = Self::split_path(to);
        let parent = self.resolve_node(dir)?;
        if parent.kind != NodeKind::Dir {
            return Err(Error::Invalid);
        }
        node.parent = parent.node;
        node.name = Name::new(base)?;
        if let Err(e) = self.apply_move(node) {
            match e {
                Error::Exists => {
                    self.del_node(to)?;
                    self.apply_move(node)?;
                }
                other => return Err(other),
            }
        }
        let block = self.create_block(Op::Move, node.node, 0, 0)?;
        self.write_node_block(&block, &node)
    }

    // Delete

    /// Unlinks `node`'s rows and marks every block it owns FREE.
    ///
    /// Replay skips the children check: rewritten history can leave a child
    /// under a directory deleted before it, and the orphan is collected by
    /// its own later delete.
    fn remove_node(&mut self, node: &NodeRecord, check_children: bool) -> Result<()> {
        let id = node.node;
        if check_children && node.kind == NodeKind::Dir {
            if self
                .nodes
                .first(INDEX_LOOKUP, move |n: &NodeRecord| n.parent.cmp(&id))
                .is_ok()
            {
                return Err(Error::Invalid);
            }
        }
        match self
            .nodes
            .delete(INDEX_PRIMARY, move |n: &NodeRecord| n.node.cmp(&id))
        {
            Err(Error::NotFound) => {}
            other => other?,
        }
        // The lookup index keys on (operation, node), so each operation
        // class is visited separately.
        for op in [Op::Node, Op::Data, Op::Truncate, Op::Delete, Op::Move] {
            self.blocks.update(
                INDEX_LOOKUP,
                move |b: &BlockRecord| b.op.cmp(&op).then(b.node.cmp(&id)),
                |b| b.op = Op::Free,
            )?;
        }
        Ok(())
    }

    /// Deletes the node at `path`; directories must be empty.
    pub fn del_node(&mut self, path: &str) -> Result<()> {
        let node = self.resolve_node(path)?;
        self.remove_node(&node, true)?;
        let block = self.create_block(Op::Delete, node.node, 0, 0)?;
        self.write_node_block(&block, &node)
    }

    /// Shrinks or frees DATA blocks past `new_size` and clears stale
    /// TRUNCATE blocks for the node.
    fn truncate_blocks(&mut self, node: u32, new_size: u64) -> Result<()> {
        let payload_size = self.payload_size as u64;
        self.blocks.update(
            INDEX_LOOKUP,
            move |b: &BlockRecord| {
                let group = b.op.cmp(&Op::Data).then(b.node.cmp(&node));
                if group != Ordering::Equal {
                    return group;
                }
                // Nothing left of new_size by a whole payload can straddle
                // the cut.
                if b.offset + payload_size < new_size {
                    return Ordering::Less;
                }
                Ordering::Equal
            },
            |b| {
                if b.offset >= new_size {
                    b.op = Op::Free;
                } else {
                    let end = (b.offset + b.fill as u64).min(new_size);
                    b.fill = (end - b.offset) as u16;
                }
            },
        )?;
        self.blocks.update(
            INDEX_LOOKUP,
            move |b: &BlockRecord| b.op.cmp(&Op::Truncate).then(b.node.cmp(&node)),
            |b| b.op = Op::Free,
        )
    }

    /// Truncates the file `node` to `new_size` bytes.
    pub fn del_data(&mut self, node: u32, new_size: u64) -> Result<()> {
        let existing = self.nodes.first(INDEX_PRIMARY, move |n: &NodeRecord| {
            n.node.cmp(&node).then(n.kind.cmp(&NodeKind::File))
        })?;
        self.truncate_blocks(existing.node, new_size)?;
        let block = self.create_block(Op::Truncate, existing.node, 0, new_size)?;
        if let Some(io) = &mut self.io {
            io.write2(block.block, &block.tag().encode(), &block.head().encode())?;
        }
        Ok(())
    }

    // Format and replay

    /// Overwrites every tag with a random sequence number and an operation
    /// byte outside the valid range, so a later scan sees an empty
    /// container. Payloads are left in place.
    fn format(&mut self) -> Result<()> {
        let Some(io) = &mut self.io else {
            return Ok(());
        };
        for block in io.block_first()..=io.block_last() {
            let operation = loop {
                let raw = (OsRng.next_u32() & 0xff) as u8;
                if raw > OP_LAST {
                    break raw;
                }
            };
            let tag = Tag {
                seq: OsRng.next_u64(),
                operation,
            };
            io.write(block, &tag.encode())?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(io) = self.io.take() else {
            return Ok(());
        };
        let result = self.replay(&io);
        self.io = Some(io);
        result
    }

    /// Rebuilds the tables from the container: scan every tag, order by
    /// sequence number, apply each operation.
    fn replay(&mut self, io: &BlockIo) -> Result<()> {
        let mut tags: Vec<TaggedBlock> = Vec::new();
        for block in io.block_first()..=io.block_last() {
            let mut buf = [0u8; TAG_SIZE];
            io.read(block, &mut buf)?;
            let tag = Tag::decode(&buf);
            if tag.operation >= OP_LAST {
                break; // uninitialized tail
            }
            tags.push(TaggedBlock { block, tag });
        }
        tags.sort_by_key(|t| t.tag.seq);

        for cursor in &tags {
            let op = Op::from_raw(cursor.tag.operation).ok_or(Error::NotSupported)?;
            let head = read_head(io, cursor.block)?;
            match op {
                Op::Node => {
                    let entry = read_node_payload(io, cursor.block)?;
                    self.nodes.insert_or_replace(entry)?;
                }
                Op::Move => {
                    // The row is gone when its NODE block was reclaimed; the
                    // move then only accounts for the block.
                    let entry = read_node_payload(io, cursor.block)?;
                    let probe = self.nodes.first(INDEX_PRIMARY, move |n: &NodeRecord| {
                        record::node_cmp_primary(n, &entry)
                    });
                    match probe {
                        Ok(_) => self.nodes.insert_or_replace(entry)?,
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                }
                Op::Delete => {
                    let entry = read_node_payload(io, cursor.block)?;
                    self.remove_node(&entry, false)?;
                }
                Op::Truncate => {
                    self.truncate_blocks(head.node, head.offset)?;
                }
                Op::Data | Op::Free => {}
            }
            self.record_block(BlockRecord {
                block: cursor.block,
                seq: cursor.tag.seq,
                op,
                node: head.node,
                fill: head.fill,
                offset: head.offset,
            })?;
            if cursor.block >= self.next_block_id {
                self.next_block_id = cursor.block + 1;
            }
        }
        if let Some(last) = tags.last() {
            self.next_seq_id = last.tag.seq + 1;
        }
        Ok(())
    }
}

fn read_head(io: &BlockIo, block: u64) -> Result<DataHead> {
    let mut buf = [0u8; DATA_SIZE];
    io.read_slice(block, TAG_SIZE, &mut buf)?;
    Ok(DataHead::decode(&buf))
}

fn read_node_payload(io: &BlockIo, block: u64) -> Result<NodeRecord> {
    let mut buf = [0u8; NODE_SIZE];
    io.read_slice(block, OVERHEAD_SIZE, &mut buf)?;
    NodeRecord::decode(&buf)
}

impl fmt::Display for AppendFs {
    /// Renders the counters and both tables, ordered by the lookup index.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " info")?;
        writeln!(f, "+--------------+----------------------+")?;
        writeln!(f, "| next node    | {:>20} |", self.next_node_id)?;
        writeln!(f, "| next seq     | {:>20} |", self.next_seq_id)?;
        writeln!(f, "| block size   | {:>20} |", self.block_size)?;
        writeln!(f, "| payload size | {:>20} |", self.payload_size)?;
        writeln!(f, "| first block  | {:>20} |", self.first_block_id)?;
        writeln!(f, "| next block   | {:>20} |", self.next_block_id)?;
        writeln!(f, "| last block   | {:>20} |", self.last_block_id)?;
        if let Ok(status) = self.get_status() {
            writeln!(f, "| free blocks  | {:>20} |", status.free_blocks)?;
        }
        writeln!(f, "+--------------+----------------------+")?;

        writeln!(f, " nodes")?;
        writeln!(
            f,
            "+------+--------+------+------+------------+------------+----------+"
        )?;
        writeln!(
            f,
            "| node | parent | type | mode | access     | modify     | name     |"
        )?;
        let mut row = Ok(());
        self.nodes
            .each_by_index(INDEX_LOOKUP, |n| {
                if row.is_ok() {
                    row = writeln!(
                        f,
                        "| {:>4} | {:>6} | {:>4} | {:>4} | {:>10} | {:>10} | {:>8} |",
                        n.node,
                        n.parent,
                        n.kind.raw(),
                        n.mode,
                        n.atime,
                        n.mtime,
                        n.name
                    );
                }
            })
            .map_err(|_| fmt::Error)?;
        row?;

        writeln!(f, " blocks")?;
        writeln!(f, "+-------+-----+------+------+------+--------+")?;
        writeln!(f, "| block | seq | op   | node | fill | offset |")?;
        let mut row = Ok(());
        self.blocks
            .each_by_index(INDEX_LOOKUP, |b| {
                if row.is_ok() {
                    row = writeln!(
                        f,
                        "| {:>5} | {:>3} | {:>4} | {:>4} | {:>4} | {:>6} |",
                        b.block,
                        b.seq,
                        b.op.raw(),
                        b.node,
                        b.fill,
                        b.offset
                    );
                }
            })
            .map_err(|_| fmt::Error)?;
        row
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::{IoConfig, MEMORY_PATH};
    use std::path::PathBuf;

    fn memory_io() -> BlockIo {
        BlockIo::open(&IoConfig {
            path: PathBuf::from(MEMORY_PATH),
            block_size: 512,
            max_blocks: Some(100),
        })
        .unwrap()
    }

    fn detached() -> AppendFs {
        AppendFs::detached().unwrap()
    }

    fn names_in(fs: &AppendFs, path: &str) -> Vec<String> {
        let mut names = Vec::new();
        fs.get_dir(path, |entry| names.push(entry.name.to_string()))
            .unwrap();
        names
    }

    #[test]
    fn set_file() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();
        assert!(matches!(fs.set_file("/foo"), Err(Error::Exists)));
    }

    #[test]
    fn set_dir_tree() {
        let mut fs = detached();
        fs.set_dir("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_file("/baz").unwrap();
        fs.set_dir("/foo/bar").unwrap();
        // Picks the right "bar".
        fs.set_file("/foo/bar/baz").unwrap();
        // Parent is not a directory.
        assert!(matches!(fs.set_file("/baz/bar"), Err(Error::Invalid)));
        // Parent does not exist.
        assert!(matches!(
            fs.set_file("/foo/bork/baz"),
            Err(Error::NotFound)
        ));
        assert!(matches!(fs.set_dir("/foo"), Err(Error::Exists)));
    }

    #[test]
    fn set_link() {
        let mut fs = detached();
        fs.set_link("/foo", "../bar").unwrap();
        assert!(matches!(
            fs.set_link("/long", "x".repeat(NAME_MAX + 1).as_str()),
            Err(Error::Invalid)
        ));
    }

    #[test]
    fn set_data() {
        let mut fs = detached();
        fs.set_data(1, b"Hello world!", 0).unwrap();
        fs.set_data(1, b"Testing", 0).unwrap();
    }

    #[test]
    fn set_time() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();
        fs.set_time("/foo", 100, 200).unwrap();

        let stat = fs.get_node("/foo").unwrap();
        assert_eq!(stat.atime, 100);
        assert_eq!(stat.mtime, 200);

        let stat = fs.get_node("/bar").unwrap();
        assert!(stat.atime > 0);
        assert!(stat.mtime > 0);
    }

    #[test]
    fn set_time_unchanged_is_skipped() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        let mtime = fs.get_node("/foo").unwrap().mtime;
        let seq = fs.next_seq_id;
        fs.set_time("/foo", 1, mtime).unwrap();
        assert_eq!(fs.next_seq_id, seq);
    }

    #[test]
    fn set_mode() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_mode("/foo", 0o640).unwrap();
        assert_eq!(fs.get_node("/foo").unwrap().mode, 0o640);

        let seq = fs.next_seq_id;
        fs.set_mode("/foo", 0o640).unwrap();
        assert_eq!(fs.next_seq_id, seq);
    }

    #[test]
    fn get_status() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_link("/baz", "foo").unwrap();
        fs.del_node("/foo").unwrap();

        let status = fs.get_status().unwrap();
        assert_eq!(status.block_size, 64);
        assert_eq!(status.total_blocks, u64::MAX - 1);
        // Five blocks used, the freed NODE block and the DELETE block count
        // as reusable.
        assert_eq!(status.free_blocks, u64::MAX - 1 - 5 + 2);
        assert_eq!(status.name_max, NAME_MAX);
    }

    #[test]
    fn get_node() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_link("/baz", "foo").unwrap();

        let stat = fs.get_node("/foo").unwrap();
        assert_eq!(stat.kind, NodeKind::File);
        assert_eq!(stat.node, 1);
        assert_eq!(stat.size, 0);

        assert_eq!(fs.get_node("/bar").unwrap().kind, NodeKind::Dir);
        let stat = fs.get_node("/baz").unwrap();
        assert_eq!(stat.kind, NodeKind::Link);
        assert_eq!(stat.size, 3);
        assert!(matches!(fs.get_node("/bork"), Err(Error::NotFound)));
    }

    #[test]
    fn get_node_size() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, b"Hello", 0).unwrap();
        fs.set_data(1, b" world", 5).unwrap();
        fs.set_data(1, b"!", 11).unwrap();
        assert_eq!(fs.get_node("/foo").unwrap().size, 12);
    }

    #[test]
    fn get_dir() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_file("/bar/bork").unwrap();
        fs.set_link("/baz", "foo").unwrap();

        assert_eq!(names_in(&fs, "/"), vec!["bar", "baz", "foo"]);
        assert_eq!(names_in(&fs, "/bar"), vec!["bork"]);
    }

    #[test]
    fn get_link() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_link("/baz", "../foo").unwrap();

        let payload = fs.get_link("/baz").unwrap();
        assert_eq!(payload.name.as_bytes(), b"../foo");
        assert!(matches!(fs.get_link("/foo"), Err(Error::Invalid)));
    }

    #[test]
    fn del_file() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, b"Hello world!", 0).unwrap();
        assert!(matches!(fs.set_file("/foo"), Err(Error::Exists)));
        fs.del_node("/foo").unwrap();
        fs.set_file("/foo").unwrap();
    }

    #[test]
    fn del_dir() {
        let mut fs = detached();
        fs.set_dir("/foo").unwrap();
        fs.set_file("/foo/bar").unwrap();
        fs.set_dir("/baz").unwrap();

        assert!(matches!(fs.del_node("/foo"), Err(Error::Invalid)));
        fs.del_node("/foo/bar").unwrap();
        fs.del_node("/foo").unwrap();
        fs.set_file("/foo").unwrap();
    }

    #[test]
    fn del_link() {
        let mut fs = detached();
        fs.set_link("/foo", "link").unwrap();
        assert!(matches!(fs.del_node("link"), Err(Error::NotFound)));
        fs.del_node("/foo").unwrap();
        assert!(matches!(fs.get_node("/foo"), Err(Error::NotFound)));
        // Both the link row and its payload row are gone.
        assert!(matches!(fs.link_payload(1), Err(Error::NotFound)));
    }

    #[test]
    fn del_node_when_full() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();

        // Pretend every block is taken.
        fs.next_block_id = fs.last_block_id + 1;
        assert!(matches!(fs.set_file("/baz"), Err(Error::NoSpace)));

        fs.del_node("/foo").unwrap();
        fs.set_file("/baz").unwrap();
        assert_eq!(names_in(&fs, "/"), vec!["bar", "baz"]);
    }

    #[test]
    fn reuse_after_delete() {
        // A container with exactly two usable blocks.
        let io = BlockIo::open(&IoConfig {
            path: PathBuf::from(MEMORY_PATH),
            block_size: 512,
            max_blocks: Some(3),
        })
        .unwrap();
        let mut fs = AppendFs::new(io, true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();
        assert!(matches!(fs.set_file("/baz"), Err(Error::NoSpace)));
        fs.del_node("/foo").unwrap();
        fs.set_file("/baz").unwrap();
        assert!(fs.get_node("/baz").is_ok());
    }

    #[test]
    fn del_data() {
        // Backed by a container so the truncated content can be read back.
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, b"abcdefgh", 0).unwrap();
        fs.set_data(1, b"ijklmnop", 8).unwrap();
        fs.set_data(1, b"qrstuvwx", 16).unwrap();
        fs.set_data(1, b"yz", 24).unwrap();

        fs.del_data(1, 18).unwrap();
        let mut buf = [0u8; 26];
        let read = fs.get_data(1, &mut buf, 0).unwrap();
        assert_eq!(read, 18);
        assert_eq!(&buf[..18], b"abcdefghijklmnopqr");
        assert_eq!(fs.get_node("/foo").unwrap().size, 18);

        fs.del_data(1, 15).unwrap();
        let read = fs.get_data(1, &mut buf, 0).unwrap();
        assert_eq!(read, 15);
        assert_eq!(&buf[..15], b"abcdefghijklmno");
    }

    #[test]
    fn del_data_leaves_other_nodes() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, b"Hello world!", 0).unwrap();
        fs.set_file("/bar").unwrap();
        fs.set_data(2, b"bork bork bork!", 0).unwrap();

        fs.del_data(1, 0).unwrap();

        let mut buf = [0u8; 15];
        assert_eq!(fs.get_data(1, &mut buf, 0).unwrap(), 0);
        assert_eq!(fs.get_data(2, &mut buf, 0).unwrap(), 15);
        assert_eq!(&buf, b"bork bork bork!");
    }

    #[test]
    fn del_data_missing_node() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        assert!(matches!(fs.del_data(2, 5), Err(Error::NotFound)));
    }

    #[test]
    fn move_file() {
        let mut fs = detached();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();
        fs.set_dir("/dir1").unwrap();
        fs.set_dir("/dir2").unwrap();

        fs.move_node("/foo", "/baz").unwrap();
        fs.move_node("/baz", "/dir1/foo").unwrap();
        // Moving onto a directory is not a shortcut for moving below it.
        assert!(matches!(
            fs.move_node("/dir1/foo", "/dir2"),
            Err(Error::Invalid)
        ));
        // Overwrites the existing file, keeping the moved node's id.
        fs.move_node("/dir1/foo", "/bar").unwrap();
        assert_eq!(fs.get_node("/bar").unwrap().node, 1);
        assert_eq!(names_in(&fs, "/"), vec!["bar", "dir1", "dir2"]);
        assert!(matches!(
            fs.move_node("/foo", "/baz"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn load_state() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_link("/baz", "../link").unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.next_node_id, 4);
        assert_eq!(fs.next_block_id, 5);
        assert_eq!(fs.next_seq_id, 5);
        assert_eq!(fs.to_string(), expected);
    }

    #[test]
    fn load_del_node() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();
        fs.set_link("/baz", "../link").unwrap();
        fs.del_node("/foo").unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);
        assert!(matches!(fs.get_node("/foo"), Err(Error::NotFound)));
    }

    #[test]
    fn load_del_node_partial() {
        // A delete still replays when the node's NODE block was reclaimed
        // and the node never materializes.
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();

        // Force the next write over foo's NODE block.
        fs.next_block_id = 1;
        fs.set_file("/baz").unwrap();

        fs.next_block_id = 3;
        fs.del_node("/foo").unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);
    }

    #[test]
    fn load_move_node() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_file("/bar").unwrap();
        fs.set_dir("/dir1").unwrap();

        fs.move_node("/foo", "/bar").unwrap();
        fs.move_node("/bar", "/dir1/foo").unwrap();
        fs.move_node("/dir1", "/dir2").unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);
        assert_eq!(fs.get_node("/dir2/foo").unwrap().node, 1);
    }

    #[test]
    fn load_get_data() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_data(1, b"Hello world!", 0).unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);

        let mut buf = [0u8; 12];
        assert_eq!(fs.get_data(1, &mut buf, 0).unwrap(), 12);
        assert_eq!(&buf, b"Hello world!");
    }

    #[test]
    fn load_get_data_overlay() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_data(1, b"xxxxxxxxxxxxxxxx", 0).unwrap();
        fs.set_data(1, b"aaaaaaaaaaaa", 2).unwrap();
        fs.set_data(1, b"ddd", 11).unwrap();
        fs.set_data(1, b"cccccc", 5).unwrap();
        fs.set_data(1, b"bbb", 5).unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);

        let mut buf = [0u8; 14];
        assert_eq!(fs.get_data(1, &mut buf, 1).unwrap(), 14);
        assert_eq!(&buf, b"xaaabbbcccdddx");
    }

    #[test]
    fn load_get_data_large() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        let count = 1024 * 20;
        let data: Vec<u8> = (0..count).map(|i| i as u8).collect();
        fs.set_data(1, &data, 0).unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);

        let mut buf = vec![0u8; count];
        assert_eq!(fs.get_data(1, &mut buf, 0).unwrap(), count);
        assert_eq!(buf, data);
    }

    #[test]
    fn load_del_data() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        let count = 1024 * 10;
        let data: Vec<u8> = (0..count).map(|i| i as u8).collect();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, &data, 0).unwrap();
        fs.set_file("/bar").unwrap();
        fs.set_data(2, b"bork bork bork", 0).unwrap();

        let cutoff = 5000;
        fs.del_data(1, cutoff as u64).unwrap();
        let expected = fs.to_string();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert_eq!(fs.to_string(), expected);

        let mut buf = vec![0u8; count];
        assert_eq!(fs.get_data(1, &mut buf, 0).unwrap(), cutoff);
        assert_eq!(&buf[..cutoff], &data[..cutoff]);

        let mut other = [0u8; 14];
        assert_eq!(fs.get_data(2, &mut other, 0).unwrap(), 14);
        assert_eq!(&other, b"bork bork bork");
    }

    #[test]
    fn load_del_data_missing() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_data(1, b"Hello world!", 0).unwrap();

        // Overwrite the node declaration, then truncate.
        fs.next_block_id = 1;
        fs.del_data(1, 5).unwrap();

        // Replaying the truncate for the now-missing node is silent.
        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, false).unwrap();
        assert!(matches!(fs.get_node("/foo"), Err(Error::NotFound)));

        let mut buf = [0u8; 12];
        assert_eq!(fs.get_data(1, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"Hello");
    }

    #[test]
    fn format_clears_state() {
        let mut fs = AppendFs::new(memory_io(), true).unwrap();
        fs.set_file("/foo").unwrap();
        fs.set_dir("/bar").unwrap();

        let io = fs.into_io().unwrap();
        let fs = AppendFs::new(io, true).unwrap();
        assert_eq!(fs.next_node_id, 1);
        assert_eq!(fs.next_seq_id, 1);
        assert!(matches!(fs.get_node("/foo"), Err(Error::NotFound)));
        assert_eq!(names_in(&fs, "/"), Vec::<String>::new());
    }
}
