//! Compaction: rewrites the live entries of a fileid range into fresh
//! compacted segments and reclaims the space held by shadowed versions.
//!
//! The compactor never blocks ingest for long: writes that land while it
//! runs go to the compaction index, reads consult that index first, and the
//! final merge into the main index happens in small bucketed write-lock
//! windows.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::order::{Location, Order, OrderKind};
use crate::segment::format::{
    EntryHeader, Footer, SegmentHeader, FOOTER_SIZE, MAGIC_NUMBER, SEGMENT_HEADER_SIZE,
};
use crate::segment::reader::SegmentMmap;
use crate::segment::writer::{fileid_from_filename, segment_filename};
use crate::store::engine::{EngineInner, Indexes};
use crate::store::index::HashIndex;
use crate::store::{recovery, PREFIX_COMPACTION};

/// Buckets merged per write-lock acquisition, bounding write-stall tails.
const NUM_BUCKETS_PER_LOCK: usize = 10;

fn compaction_filepath(dir: &Path, fileid: u32) -> PathBuf {
    dir.join(format!("{PREFIX_COMPACTION}{}", segment_filename(fileid)))
}

struct Outcome {
    obsolete_fileids: Vec<u32>,
}

/// Compacts `[fileid_start, fileid_end]`. Safe to run while ingest and reads
/// continue; a put issued during compaction stays visible throughout and
/// shadows anything the compactor rewrites.
pub(crate) fn compact(inner: &EngineInner, fileid_start: u32, fileid_end: u32) -> Result<()> {
    info!(fileid_start, fileid_end, "compaction starting");
    *inner.is_compaction_in_progress.lock().unwrap() = true;

    let result = compact_rewrite(inner, fileid_start, fileid_end);

    // Entries written while compaction ran were routed to the compaction
    // index. Pour them into the main index and drop the flag, on failure as
    // well, so nothing acknowledged is ever lost.
    {
        let _write = inner.gate.acquire_write();
        let mut indexes = inner.indexes.lock().unwrap();
        let Indexes { main, compaction } = &mut *indexes;
        for (hash, locations) in compaction.drain() {
            for location in locations {
                main.insert(hash, location);
            }
        }
        *inner.is_compaction_in_progress.lock().unwrap() = false;
    }

    let outcome = result?;

    // Unlink the obsolete inputs, unless live snapshots still pin them: then
    // each file gets a lock marker and the last snapshot release unlinks it.
    if inner.snapshots.register_obsolete(&outcome.obsolete_fileids) {
        for &fileid in &outcome.obsolete_fileids {
            if let Err(e) = fs::File::create(inner.lock_filepath(fileid)) {
                warn!(fileid, error = %e, "could not create lock marker");
            }
        }
    } else {
        for &fileid in &outcome.obsolete_fileids {
            if let Err(e) = fs::remove_file(inner.filepath(fileid)) {
                warn!(fileid, error = %e, "could not remove compacted input");
            }
        }
    }

    info!(
        inputs = outcome.obsolete_fileids.len(),
        "compaction finished"
    );
    Ok(())
}

fn compact_rewrite(inner: &EngineInner, fileid_start: u32, fileid_end: u32) -> Result<Outcome> {
    let dir = inner.config.dir.clone();

    // Rotate the active file so every write acknowledged so far sits in a
    // sealed, footer-bearing segment the scan below can see. The flag is
    // already up, so anything arriving from here on is indexed aside and
    // stays out of the candidate set.
    {
        let mut log = inner.log.lock().unwrap();
        log.flush_current_file(true, 0)?;
    }

    // Clean any stale outputs of an interrupted compaction.
    recovery::remove_files_with_prefix(&dir, PREFIX_COMPACTION)?;

    // 1. Decode the footers of every regular in-range file into a local
    // index. Files already compacted are skipped, damaged footers are logged
    // and their files left untouched.
    let mut index_compaction = HashIndex::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(fileid) = fileid_from_filename(&name, "") else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file()
            || inner.resources.is_file_compacted(fileid)
            || fileid < fileid_start
            || fileid > fileid_end
            || metadata.len() <= SEGMENT_HEADER_SIZE
        {
            continue;
        }
        let segment = match SegmentMmap::open(&entry.path()) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(fileid, error = %e, "could not map file for compaction");
                continue;
            }
        };
        if let Err(e) = recovery::load_file(&segment, fileid, &mut index_compaction) {
            warn!(fileid, error = %e, "damaged footer, skipping file in compaction");
        }
    }

    // 2. For each unique hash seen on disk, collect the matching live-index
    // locations: these are the candidates to classify.
    let mut candidates: Vec<(u64, Location)> = Vec::new();
    {
        let indexes = inner.indexes.lock().unwrap();
        for (hash, _) in index_compaction.buckets() {
            for &location in indexes.main.get(hash) {
                candidates.push((hash, location));
            }
        }
    }
    drop(index_compaction);

    if candidates.is_empty() {
        return Ok(Outcome {
            obsolete_fileids: Vec::new(),
        });
    }

    // 3. Classify newest-first. For any key only the most recent occurrence
    // is kept; a winning remove deletes the whole lineage; large files are
    // kept as-is.
    let mut locations_delete: HashSet<Location> = HashSet::new();
    let mut fileids_compaction: BTreeSet<u32> = BTreeSet::new();
    let mut fileids_largefiles_keep: HashSet<u32> = HashSet::new();
    let mut keys_encountered: HashSet<Vec<u8>> = HashSet::new();
    let mut keep_regular: Vec<(u64, Location)> = Vec::new();
    let mut keep_large: Vec<(u64, Location)> = Vec::new();

    for &(hash, location) in candidates.iter().rev() {
        let fileid = location.fileid();
        if fileid > fileid_end {
            // Written after the compaction range was chosen; left alone.
            continue;
        }
        if inner.resources.writes_in_progress(fileid) > 0 {
            // A multi-chunk entry is still streaming into this file; it has
            // no footer yet and must not be rewritten or unlinked.
            continue;
        }
        fileids_compaction.insert(fileid);
        let entry = match inner.get_entry(location) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(location = location.0, error = %e, "unreadable candidate, skipping");
                continue;
            }
        };
        let first_occurrence = keys_encountered.insert(entry.key().to_vec());
        if first_occurrence {
            if inner.resources.is_file_large(fileid) {
                keep_large.push((hash, location));
                fileids_largefiles_keep.insert(fileid);
            } else if !entry.header.is_remove() {
                keep_regular.push((hash, location));
            } else {
                locations_delete.insert(location);
            }
        } else {
            locations_delete.insert(location);
        }
    }
    drop(candidates);
    drop(keys_encountered);

    // 4. Cluster kept locations by hash: within a cluster the smallest
    // location is the rewrite site, the others are secondary and get
    // deduplicated into it.
    let mut clusters: HashMap<Location, Vec<Location>> = HashMap::new();
    let mut locations_secondary: HashSet<Location> = HashSet::new();
    for (_, mut locations) in keep_regular.into_iter().into_group_map() {
        locations.sort_unstable();
        for &secondary in &locations[1..] {
            locations_secondary.insert(secondary);
        }
        clusters.insert(locations[0], locations.clone());
    }

    // 5. Map every in-range file (large keeps excluded).
    let mut mmaps: HashMap<u32, SegmentMmap> = HashMap::new();
    for &fileid in &fileids_compaction {
        if fileids_largefiles_keep.contains(&fileid) {
            continue;
        }
        match SegmentMmap::open(&inner.filepath(fileid)) {
            Ok(segment) => {
                mmaps.insert(fileid, segment);
            }
            Err(e) => warn!(fileid, error = %e, "could not map compaction input"),
        }
    }

    // 6. Walk entries in file order and emit put orders for everything that
    // survives. The stored checksums are not re-verified: compaction is a
    // byte-level transfer, and a damaged value surfaces at read time exactly
    // as it would have from the original file.
    let mut orders: Vec<Order> = Vec::new();
    let mut timestamp_max = 0u64;
    for &fileid in &fileids_compaction {
        let Some(segment) = mmaps.get(&fileid) else {
            continue;
        };
        let data = segment.data();
        let header = match SegmentHeader::decode(data) {
            Ok(header) => header,
            Err(e) => {
                warn!(fileid, error = %e, "unreadable header during compaction, skipping file");
                continue;
            }
        };
        timestamp_max = timestamp_max.max(header.timestamp);

        let offset_end = body_end(data);

        let mut offset = SEGMENT_HEADER_SIZE as usize;
        while (offset as u64) < offset_end {
            let Ok((entry, size_header)) = EntryHeader::decode(&data[offset..]) else {
                break;
            };
            if entry.size_key == 0 {
                break;
            }
            let advance =
                size_header + entry.size_key as usize + entry.size_value_offset() as usize;
            if offset + advance > data.len() {
                break;
            }
            let location = Location::new(fileid, offset as u32);
            if locations_delete.contains(&location) || locations_secondary.contains(&location) {
                offset += advance;
                continue;
            }

            let members = clusters
                .get(&location)
                .cloned()
                .unwrap_or_else(|| vec![location]);
            for member in members {
                let Some(member_segment) = mmaps.get(&member.fileid()) else {
                    continue;
                };
                let member_entry = match member_segment.entry_at(member.offset()) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(location = member.0, error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                // Orders carry the running CRC over key and value; recompute
                // it from the mapped bytes so the rewritten header checksums
                // correctly. The bytes themselves are copied untouched.
                let payload_crc = crc32c::crc32c_append(
                    crc32c::crc32c(member_entry.key()),
                    member_entry.value_used(),
                );
                orders.push(Order {
                    session: 0,
                    kind: OrderKind::Put,
                    key: member_entry.key().to_vec(),
                    chunk: member_entry.value_used().to_vec(),
                    offset_chunk: 0,
                    size_value: member_entry.header.size_value,
                    size_value_compressed: member_entry.header.size_value_compressed,
                    crc32: payload_crc,
                });
            }
            offset += advance;
        }
    }
    drop(mmaps);

    // 7. Persist the surviving entries through the compaction log manager.
    // Its timestamp is locked to the maximum of the inputs so every output
    // file sorts after every input at the next recovery.
    let (map_index, fileid_first, num_files_compacted) = {
        let mut log_compaction = inner.log_compaction.lock().unwrap();
        let fileid_first = log_compaction.sequence_fileid();
        log_compaction.lock_sequence_timestamp(timestamp_max);
        let map_index = log_compaction.write_orders_and_flush(&orders)?;
        log_compaction.flush_current_file(true, 0)?;
        let num = log_compaction.sequence_fileid() - fileid_first;
        (map_index, fileid_first, num)
    };
    drop(orders);

    // 8. Allocate the output fileid range in the main log.
    let offset_fileid = {
        let mut log = inner.log.lock().unwrap();
        log.increment_sequence_fileid(num_files_compacted) - num_files_compacted
    };

    // 9. Rename each compaction output to its final name and carry over its
    // size and compacted flag.
    for i in 1..=num_files_compacted {
        let fileid_compaction = fileid_first + i;
        let fileid_new = offset_fileid + i;
        let from = compaction_filepath(&dir, fileid_compaction);
        let to = inner.filepath(fileid_new);
        fs::rename(&from, &to).map_err(|e| Error::io("could not rename compaction output", e))?;
        let filesize = inner.compaction_resources.filesize(fileid_compaction);
        inner.resources.set_filesize(fileid_new, filesize);
        inner.resources.set_file_compacted(fileid_new);
    }

    // 10/11. Shift the returned locations into the renamed fileids and
    // append the untouched large locations.
    let mut map_index_shifted: Vec<(u64, Location)> = map_index
        .into_iter()
        .map(|(hash, location)| {
            let fileid_new = location.fileid() - fileid_first + offset_fileid;
            (hash, location.with_fileid(fileid_new))
        })
        .collect();
    map_index_shifted.extend(keep_large);

    // 12. Merge into the main index in bucketed batches. Locations with
    // fileids beyond the range were written during compaction and must
    // survive the bucket swap.
    let grouped: Vec<(u64, Vec<Location>)> = map_index_shifted
        .into_iter()
        .into_group_map()
        .into_iter()
        .collect();
    for chunk in grouped.chunks(NUM_BUCKETS_PER_LOCK) {
        let _write = inner.gate.acquire_write();
        let mut indexes = inner.indexes.lock().unwrap();
        for (hash, locations) in chunk {
            let existing = indexes.main.take_bucket(*hash);
            let survivors: Vec<Location> = existing
                .into_iter()
                .filter(|location| location.fileid() > fileid_end)
                .collect();
            for &location in locations {
                indexes.main.insert(*hash, location);
            }
            for location in survivors {
                indexes.main.insert(*hash, location);
            }
        }
    }

    let obsolete_fileids: Vec<u32> = fileids_compaction
        .into_iter()
        .filter(|fileid| !fileids_largefiles_keep.contains(fileid))
        .collect();
    Ok(Outcome { obsolete_fileids })
}

/// Where the entry region of a mapped segment ends: the footer-index offset
/// when the footer validates, the end of the file otherwise.
fn body_end(data: &[u8]) -> u64 {
    if (data.len() as u64) < SEGMENT_HEADER_SIZE + FOOTER_SIZE {
        return data.len() as u64;
    }
    let Ok(footer) = Footer::decode(&data[data.len() - FOOTER_SIZE as usize..]) else {
        return data.len() as u64;
    };
    if footer.magic_number != MAGIC_NUMBER {
        return data.len() as u64;
    }
    let offset_indexes = footer.offset_indexes as usize;
    if offset_indexes + 4 > data.len() {
        return data.len() as u64;
    }
    if crc32c::crc32c(&data[offset_indexes..data.len() - 4]) != footer.crc32 {
        return data.len() as u64;
    }
    footer.offset_indexes
}
