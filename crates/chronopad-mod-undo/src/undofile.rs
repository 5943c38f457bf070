/// The on-disk undo file: a versioned big-endian serialization of a
/// whole undo tree, bound to the buffer content by a SHA-256 hash.
///
/// Reading is all-or-nothing: the file is parsed and validated into a
/// detached structure first, and the in-memory tree is replaced only
/// when every check passes. A file whose hash does not match the live
/// buffer is rejected without touching the tree.
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::buffer::UndoBuffer;
use crate::error::UndoError;
use crate::tree::UndoTree;
use crate::types::{
    ChangeEntry, CursorSnapshot, HeaderFlags, MarkPos, SavedLine, Seq, UndoHeader,
    VisualSelection, NUM_NAMED_MARKS,
};

const UF_MAGIC: &[u8; 9] = b"ChronUnDo";
const UF_VERSION: u16 = 1;
const UF_HEADER_MAGIC: u16 = 0x5fd0;
const UF_HEADER_END_MAGIC: u16 = 0xe7aa;
const UF_ENTRY_MAGIC: u16 = 0xf518;
const UF_ENTRY_END_MAGIC: u16 = 0x3581;

/// File-level extension record: last file-write number.
const UFC_SAVE_NR_LAST: u8 = 1;
/// Header-level extension record: the write that created the header.
const UHC_SAVE_NR: u8 = 1;

/// Upper bounds rejected as corruption rather than attempted.
const MAX_HEADERS: u32 = 1_000_000;
const MAX_LINE_BYTES: u32 = 16 * 1024 * 1024;

/// Hashes the buffer content the way the undo file records it: every
/// line followed by a newline.
pub(crate) fn content_hash<B: UndoBuffer>(buf: &B) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for lnum in 1..=buf.line_count() {
        hasher.update(buf.line(lnum).as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

fn opt_to_u32(seq: Option<Seq>) -> u32 {
    seq.map_or(0, |s| s as u32)
}

fn u32_to_opt(raw: u32) -> Option<Seq> {
    (raw != 0).then_some(raw as Seq)
}

/// True when the file starts with the undo-file magic.
fn is_undo_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; UF_MAGIC.len()];
    file.read_exact(&mut magic).is_ok() && &magic == UF_MAGIC
}

// ── Writing ──────────────────────────────────────────────────────────

pub(crate) fn write<B: UndoBuffer>(
    tree: &UndoTree,
    buf: &B,
    path: &Path,
    force: bool,
) -> Result<(), UndoError> {
    if !force && path.exists() && !is_undo_file(path) {
        return Err(UndoError::NotAllowed(
            "existing file is not an undo file (use force to overwrite)",
        ));
    }
    let file = File::create(path).map_err(UndoError::WriteFailed)?;
    let mut w = BufWriter::new(file);
    if let Err(err) = write_body(tree, buf, &mut w).and_then(|()| w.flush()) {
        drop(w);
        // Never leave a half-written undo file behind.
        let _ = std::fs::remove_file(path);
        return Err(UndoError::WriteFailed(err));
    }
    tracing::debug!(path = %path.display(), headers = tree.header_count(), "wrote undo file");
    Ok(())
}

fn write_body<B: UndoBuffer, W: Write>(tree: &UndoTree, buf: &B, w: &mut W) -> io::Result<()> {
    w.write_all(UF_MAGIC)?;
    w.write_u16::<BigEndian>(UF_VERSION)?;
    w.write_all(&content_hash(buf))?;
    w.write_u32::<BigEndian>(buf.line_count() as u32)?;

    // A saved line always carries lnum >= 1, so lnum 0 marks absence and
    // an empty snapshot text survives the round trip.
    match &tree.saved_line {
        Some(saved) => {
            w.write_u32::<BigEndian>(saved.text.len() as u32)?;
            w.write_all(saved.text.as_bytes())?;
            w.write_u32::<BigEndian>(saved.lnum as u32)?;
            w.write_u32::<BigEndian>(saved.col as u32)?;
        }
        None => {
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(0)?;
        }
    }

    w.write_u32::<BigEndian>(opt_to_u32(tree.oldest))?;
    w.write_u32::<BigEndian>(opt_to_u32(tree.newest))?;
    w.write_u32::<BigEndian>(opt_to_u32(tree.current))?;
    w.write_u32::<BigEndian>(tree.headers.len() as u32)?;
    w.write_u32::<BigEndian>(tree.seq_last as u32)?;
    w.write_u32::<BigEndian>(tree.seq_cur as u32)?;
    w.write_u64::<BigEndian>(tree.time_cur)?;

    // File-level extension records: length-prefixed so old readers can
    // skip what they do not know.
    w.write_u8(5)?;
    w.write_u8(UFC_SAVE_NR_LAST)?;
    w.write_u32::<BigEndian>(tree.save_nr_last as u32)?;
    w.write_u8(0)?;

    let mut seqs: Vec<Seq> = tree.headers.keys().copied().collect();
    seqs.sort_unstable();
    for seq in seqs {
        write_header(tree.hdr(seq), w)?;
    }
    w.write_u16::<BigEndian>(UF_HEADER_END_MAGIC)?;
    Ok(())
}

fn write_pos<W: Write>(pos: MarkPos, w: &mut W) -> io::Result<()> {
    w.write_u32::<BigEndian>(pos.lnum as u32)?;
    w.write_u32::<BigEndian>(pos.col as u32)?;
    w.write_u32::<BigEndian>(pos.coladd as u32)
}

fn write_header<W: Write>(h: &UndoHeader, w: &mut W) -> io::Result<()> {
    w.write_u16::<BigEndian>(UF_HEADER_MAGIC)?;
    w.write_u32::<BigEndian>(opt_to_u32(h.next))?;
    w.write_u32::<BigEndian>(opt_to_u32(h.prev))?;
    w.write_u32::<BigEndian>(opt_to_u32(h.alt_next))?;
    w.write_u32::<BigEndian>(opt_to_u32(h.alt_prev))?;
    w.write_u32::<BigEndian>(h.seq as u32)?;

    w.write_u32::<BigEndian>(h.cursor.lnum as u32)?;
    w.write_u32::<BigEndian>(h.cursor.col as u32)?;
    w.write_u32::<BigEndian>(h.cursor.coladd as u32)?;
    w.write_i32::<BigEndian>(h.cursor.vcol as i32)?;
    w.write_u16::<BigEndian>(h.flags.to_bits())?;

    for mark in &h.named_marks {
        write_pos(*mark, w)?;
    }

    write_pos(h.visual.start, w)?;
    write_pos(h.visual.end, w)?;
    w.write_u32::<BigEndian>(h.visual.mode as u32)?;
    w.write_u32::<BigEndian>(h.visual.curswant as u32)?;
    w.write_u64::<BigEndian>(h.time)?;

    // Header-level extension records.
    if h.save_number != 0 {
        w.write_u8(5)?;
        w.write_u8(UHC_SAVE_NR)?;
        w.write_u32::<BigEndian>(h.save_number as u32)?;
    }
    w.write_u8(0)?;

    for entry in &h.entries {
        w.write_u16::<BigEndian>(UF_ENTRY_MAGIC)?;
        w.write_u32::<BigEndian>(entry.top as u32)?;
        w.write_u32::<BigEndian>(entry.bot as u32)?;
        w.write_u32::<BigEndian>(entry.lcount as u32)?;
        w.write_u32::<BigEndian>(entry.size() as u32)?;
        for line in &entry.lines {
            w.write_u32::<BigEndian>(line.len() as u32)?;
            w.write_all(line.as_bytes())?;
        }
    }
    w.write_u16::<BigEndian>(UF_ENTRY_END_MAGIC)
}

// ── Reading ──────────────────────────────────────────────────────────

/// What a fully validated undo file parses into, before installation.
struct ParsedFile {
    saved_line: Option<SavedLine>,
    oldest: Option<Seq>,
    newest: Option<Seq>,
    current: Option<Seq>,
    seq_last: Seq,
    seq_cur: Seq,
    time_cur: u64,
    save_nr_last: u64,
    headers: Vec<UndoHeader>,
}

fn corrupt(err: io::Error) -> UndoError {
    UndoError::CorruptFile(format!("truncated or unreadable data: {err}"))
}

fn bad(what: &str) -> UndoError {
    UndoError::CorruptFile(what.to_string())
}

pub(crate) fn read_into<B: UndoBuffer>(
    tree: &mut UndoTree,
    buf: &B,
    path: &Path,
) -> Result<(), UndoError> {
    let file = File::open(path).map_err(UndoError::ReadFailed)?;
    let mut r = BufReader::new(file);
    let parsed = parse(&mut r, buf)?;

    let mut headers = std::collections::HashMap::with_capacity(parsed.headers.len());
    for h in parsed.headers {
        if headers.insert(h.seq, h).is_some() {
            return Err(bad("duplicate sequence number"));
        }
    }
    let check_ref = |r: Option<Seq>| match r {
        Some(s) if !headers.contains_key(&s) => Err(bad("reference to a missing header")),
        _ => Ok(()),
    };
    for h in headers.values() {
        check_ref(h.next)?;
        check_ref(h.prev)?;
        check_ref(h.alt_next)?;
        check_ref(h.alt_prev)?;
    }
    check_ref(parsed.oldest)?;
    check_ref(parsed.newest)?;
    check_ref(parsed.current)?;
    if !headers.is_empty() && (parsed.oldest.is_none() || parsed.newest.is_none()) {
        return Err(bad("tree roots missing"));
    }

    // The links must form a tree: walking preferred-child and sibling
    // links from the root chain reaches every header exactly once, and
    // each followed link is mirrored on the other side. Anything else
    // would loop or dangle during navigation.
    let mut seen = std::collections::HashSet::with_capacity(headers.len());
    let mut stack: Vec<Seq> = parsed.oldest.into_iter().collect();
    while let Some(seq) = stack.pop() {
        if !seen.insert(seq) {
            return Err(bad("header links form a cycle"));
        }
        let Some(h) = headers.get(&seq) else {
            return Err(bad("reference to a missing header"));
        };
        if let Some(child) = h.next {
            match headers.get(&child) {
                Some(c) if c.prev == Some(seq) => stack.push(child),
                _ => return Err(bad("child link is not mutual")),
            }
        }
        if let Some(sibling) = h.alt_next {
            match headers.get(&sibling) {
                Some(s) if s.alt_prev == Some(seq) => stack.push(sibling),
                _ => return Err(bad("sibling link is not mutual")),
            }
        }
    }
    if seen.len() != headers.len() {
        return Err(bad("unreachable headers"));
    }

    tree.headers = headers;
    tree.oldest = parsed.oldest;
    tree.newest = parsed.newest;
    tree.current = parsed.current;
    tree.seq_last = parsed.seq_last;
    tree.seq_cur = parsed.seq_cur;
    tree.time_cur = parsed.time_cur;
    tree.save_nr_last = parsed.save_nr_last;
    tree.save_nr_cur = parsed.save_nr_last;
    tree.saved_line = parsed.saved_line;
    tree.synced = true;
    tracing::debug!(path = %path.display(), headers = tree.header_count(), "read undo file");
    Ok(())
}

fn parse<B: UndoBuffer, R: Read>(r: &mut R, buf: &B) -> Result<ParsedFile, UndoError> {
    let mut magic = [0u8; UF_MAGIC.len()];
    r.read_exact(&mut magic).map_err(corrupt)?;
    if &magic != UF_MAGIC {
        return Err(bad("bad magic"));
    }
    let version = r.read_u16::<BigEndian>().map_err(corrupt)?;
    if version != UF_VERSION {
        return Err(bad("unsupported version"));
    }

    let mut stored_hash = [0u8; 32];
    r.read_exact(&mut stored_hash).map_err(corrupt)?;
    let stored_line_count = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
    if stored_hash != content_hash(buf) || stored_line_count != buf.line_count() {
        return Err(UndoError::HashMismatch);
    }

    let saved_len = r.read_u32::<BigEndian>().map_err(corrupt)?;
    if saved_len > MAX_LINE_BYTES {
        return Err(bad("saved line too long"));
    }
    let saved_text = read_string(r, saved_len)?;
    let saved_lnum = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
    let saved_col = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
    let saved_line = (saved_lnum > 0).then_some(SavedLine {
        text: saved_text,
        lnum: saved_lnum,
        col: saved_col,
    });

    let oldest = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let newest = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let current = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let num_headers = r.read_u32::<BigEndian>().map_err(corrupt)?;
    if num_headers > MAX_HEADERS {
        return Err(bad("implausible header count"));
    }
    let seq_last = r.read_u32::<BigEndian>().map_err(corrupt)? as Seq;
    let seq_cur = r.read_u32::<BigEndian>().map_err(corrupt)? as Seq;
    let time_cur = r.read_u64::<BigEndian>().map_err(corrupt)?;

    let mut save_nr_last = 0u64;
    read_extensions(r, |id, payload| {
        if id == UFC_SAVE_NR_LAST && payload.len() == 4 {
            save_nr_last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
        }
    })?;

    let mut headers = Vec::with_capacity(num_headers as usize);
    for _ in 0..num_headers {
        let tag = r.read_u16::<BigEndian>().map_err(corrupt)?;
        if tag != UF_HEADER_MAGIC {
            return Err(bad("header marker missing"));
        }
        headers.push(parse_header(r)?);
    }
    let tag = r.read_u16::<BigEndian>().map_err(corrupt)?;
    if tag != UF_HEADER_END_MAGIC {
        return Err(bad("trailing marker missing"));
    }

    Ok(ParsedFile {
        saved_line,
        oldest,
        newest,
        current,
        seq_last,
        seq_cur,
        time_cur,
        save_nr_last,
        headers,
    })
}

fn read_string<R: Read>(r: &mut R, len: u32) -> Result<String, UndoError> {
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes).map_err(corrupt)?;
    String::from_utf8(bytes).map_err(|_| bad("text is not valid UTF-8"))
}

/// Reads length-prefixed extension records until the 0 terminator,
/// handing each known or unknown record to `each`.
fn read_extensions<R: Read>(r: &mut R, mut each: impl FnMut(u8, &[u8])) -> Result<(), UndoError> {
    loop {
        let len = r.read_u8().map_err(corrupt)?;
        if len == 0 {
            return Ok(());
        }
        let id = r.read_u8().map_err(corrupt)?;
        let mut payload = vec![0u8; (len - 1) as usize];
        r.read_exact(&mut payload).map_err(corrupt)?;
        each(id, &payload);
    }
}

fn read_pos<R: Read>(r: &mut R) -> Result<MarkPos, UndoError> {
    Ok(MarkPos {
        lnum: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        col: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        coladd: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
    })
}

fn parse_header<R: Read>(r: &mut R) -> Result<UndoHeader, UndoError> {
    let next = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let prev = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let alt_next = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let alt_prev = u32_to_opt(r.read_u32::<BigEndian>().map_err(corrupt)?);
    let seq = r.read_u32::<BigEndian>().map_err(corrupt)? as Seq;
    if seq == 0 {
        return Err(bad("header with sequence number 0"));
    }

    let cursor = CursorSnapshot {
        lnum: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        col: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        coladd: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        vcol: r.read_i32::<BigEndian>().map_err(corrupt)? as i64,
    };
    let flags = HeaderFlags::from_bits(r.read_u16::<BigEndian>().map_err(corrupt)?);

    let mut named_marks = [MarkPos::default(); NUM_NAMED_MARKS];
    for mark in named_marks.iter_mut() {
        *mark = read_pos(r)?;
    }

    let visual = VisualSelection {
        start: read_pos(r)?,
        end: read_pos(r)?,
        mode: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
        curswant: r.read_u32::<BigEndian>().map_err(corrupt)? as u64,
    };
    let time = r.read_u64::<BigEndian>().map_err(corrupt)?;

    let mut save_number = 0u64;
    read_extensions(r, |id, payload| {
        if id == UHC_SAVE_NR && payload.len() == 4 {
            save_number = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
        }
    })?;

    let mut entries = Vec::new();
    loop {
        let tag = r.read_u16::<BigEndian>().map_err(corrupt)?;
        if tag == UF_ENTRY_END_MAGIC {
            break;
        }
        if tag != UF_ENTRY_MAGIC {
            return Err(bad("entry marker missing"));
        }
        let top = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
        let bot = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
        let lcount = r.read_u32::<BigEndian>().map_err(corrupt)? as u64;
        let size = r.read_u32::<BigEndian>().map_err(corrupt)?;
        if size > MAX_HEADERS {
            return Err(bad("implausible entry size"));
        }
        let mut lines = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let len = r.read_u32::<BigEndian>().map_err(corrupt)?;
            if len > MAX_LINE_BYTES {
                return Err(bad("line too long"));
            }
            lines.push(read_string(r, len)?);
        }
        entries.push(ChangeEntry {
            top,
            bot,
            lcount,
            lines,
        });
    }

    let mut header = UndoHeader::new(seq, time);
    header.next = next;
    header.prev = prev;
    header.alt_next = alt_next;
    header.alt_prev = alt_prev;
    header.flags = flags;
    header.cursor = cursor;
    header.named_marks = named_marks;
    header.visual = visual;
    header.save_number = save_number;
    header.entries = entries;
    Ok(header)
}
