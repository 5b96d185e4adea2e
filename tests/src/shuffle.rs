//! Random file mutations checked against a plain byte buffer.

use {anyhow::Result, rand::Rng, realmvault_sdk::FileBlob, tracing::debug};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Write { offset: u64, data: Vec<u8> },
    Truncate { length: u64 },
    Commit,
}

/// Picks an operation for a file of `size` bytes whose blocks hold
/// `chunk_size` bytes. Offsets stay close to the current end so that writes
/// both overwrite and extend the file.
pub fn random_op(rng: &mut impl Rng, size: u64, chunk_size: u64) -> FileOp {
    let weight = rng.random_range(0..10);
    if weight < 6 {
        let offset = rng.random_range(0..=size + chunk_size);
        let len = rng.random_range(1..=3 * chunk_size);
        let mut data = vec![0; usize::try_from(len).unwrap_or(1)];
        rng.fill(data.as_mut_slice());
        FileOp::Write { offset, data }
    } else if weight < 8 {
        FileOp::Truncate {
            length: rng.random_range(0..=size),
        }
    } else {
        FileOp::Commit
    }
}

pub fn apply_to_model(model: &mut Vec<u8>, op: &FileOp) -> Result<()> {
    match op {
        FileOp::Write { offset, data } => {
            let offset = usize::try_from(*offset)?;
            let end = offset + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[offset..end].copy_from_slice(data);
        }
        FileOp::Truncate { length } => {
            model.truncate(usize::try_from(*length)?);
        }
        FileOp::Commit => {}
    }
    Ok(())
}

pub async fn apply_to_file(file: &mut FileBlob, op: &FileOp) -> Result<()> {
    debug!(?op, size = file.size(), "applying");
    match op {
        FileOp::Write { offset, data } => {
            file.write(*offset, data).await?;
        }
        FileOp::Truncate { length } => {
            file.truncate(*length).await?;
        }
        FileOp::Commit => file.commit().await?,
    }
    Ok(())
}
