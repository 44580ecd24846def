//! Turns proctable query replies into the MPIR descriptor table.

use std::ffi::CString;

use crate::error::Error;
use crate::mpir::MPIR_PROCDESC;
use crate::pmix::{Info, InfoKey, ProcInfo, Rank, Value};

fn malformed(detail: impl Into<String>) -> Error {
    Error::MalformedReply {
        what: "proctable",
        detail: detail.into(),
    }
}

/// Pull the per-process records out of a proctable query reply.
///
/// The reply must be exactly one info item whose value is the record array;
/// anything else is a protocol violation.
pub(crate) fn records_from_reply(reply: Vec<Info>) -> Result<Vec<ProcInfo>, Error> {
    let mut reply = reply;
    let info = match (reply.pop(), reply.is_empty()) {
        (Some(info), true) => info,
        (None, _) => return Err(malformed("empty reply")),
        _ => return Err(malformed("more than one reply item")),
    };
    if info.key != InfoKey::ProcTable {
        return Err(malformed(format!("unexpected reply key {:?}", info.key)));
    }
    match info.value {
        Value::ProcTable(records) => Ok(records),
        other => Err(malformed(format!(
            "reply value is not a process array: {other:?}"
        ))),
    }
}

/// Materialise the descriptor array, one row per rank.
///
/// Records may arrive in any order; each lands at its rank index. Strings are
/// copied by value because the query reply does not outlive the table.
pub(crate) fn build(records: &[ProcInfo]) -> Result<Vec<MPIR_PROCDESC>, Error> {
    let size = records.len();
    let mut rows: Vec<Option<(CString, CString, u32)>> = (0..size).map(|_| None).collect();
    for record in records {
        let Rank::Number(rank) = record.proc.rank else {
            return Err(malformed(format!(
                "record for {} has no concrete rank",
                record.proc
            )));
        };
        let slot = rows
            .get_mut(rank as usize)
            .ok_or_else(|| malformed(format!("rank {rank} outside a table of {size}")))?;
        if slot.is_some() {
            return Err(malformed(format!("duplicate rank {rank}")));
        }
        let host = CString::new(record.hostname.as_str())
            .map_err(|_| malformed(format!("hostname of rank {rank} contains NUL")))?;
        let executable = CString::new(record.executable.as_str())
            .map_err(|_| malformed(format!("executable of rank {rank} contains NUL")))?;
        *slot = Some((host, executable, record.pid));
    }
    let descs: Vec<MPIR_PROCDESC> = rows
        .into_iter()
        .flatten()
        .map(|(host, executable, pid)| MPIR_PROCDESC {
            host_name: host.into_raw(),
            executable_name: executable.into_raw(),
            pid: pid as i32,
        })
        .collect();
    if descs.len() != size {
        return Err(malformed("ranks missing from the record array"));
    }
    Ok(descs)
}
