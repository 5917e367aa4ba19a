//! Write-ahead log for in-flight protocol runs.
//!
//! After every executed instruction the engine appends a [WalRecord]
//! carrying the full post-step context. A crash therefore loses at most
//! the step that was executing; replay takes the newest record per
//! handshake and continues from its program counter. Reaching the commit
//! instruction clears the handshake's records, so the log only ever holds
//! runs that have not taken effect yet.

use crate::abiencode::types::Address;
use crate::protocol::{Context, Protocol, Role};
use crate::wire::CorrelationKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("log io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One logged step of one protocol run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub correlation: CorrelationKey,
    pub protocol: Protocol,
    pub role: Role,
    /// Index of the next instruction to execute.
    pub pc: usize,
    /// True when the run is parked waiting for a counterparty message, so
    /// replay knows not to execute past the suspension point.
    pub waiting: bool,
    pub context: Context,
}

pub trait ProtocolLog {
    fn append(&mut self, party: Address, record: &WalRecord) -> Result<(), WalError>;
    /// All records for `party`, oldest first.
    fn records(&self, party: Address) -> Result<Vec<WalRecord>, WalError>;
    /// Drop every record of one handshake, called at commit or abort.
    fn clear(&mut self, party: Address, correlation: &CorrelationKey) -> Result<(), WalError>;
}

/// Log for tests and single-process setups.
#[derive(Default)]
pub struct MemoryLog {
    records: BTreeMap<Address, Vec<WalRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtocolLog for MemoryLog {
    fn append(&mut self, party: Address, record: &WalRecord) -> Result<(), WalError> {
        self.records.entry(party).or_default().push(record.clone());
        Ok(())
    }

    fn records(&self, party: Address) -> Result<Vec<WalRecord>, WalError> {
        Ok(self.records.get(&party).cloned().unwrap_or_default())
    }

    fn clear(&mut self, party: Address, correlation: &CorrelationKey) -> Result<(), WalError> {
        if let Some(records) = self.records.get_mut(&party) {
            records.retain(|record| record.correlation != *correlation);
        }
        Ok(())
    }
}

/// Append-only json-lines files, one per party address.
pub struct FileLog {
    dir: PathBuf,
}

impl FileLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, WalError> {
        fs::create_dir_all(&dir)?;
        Ok(FileLog {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, party: Address) -> PathBuf {
        self.dir.join(format!("{}.wal", hex::encode(party.0)))
    }
}

impl ProtocolLog for FileLog {
    fn append(&mut self, party: Address, record: &WalRecord) -> Result<(), WalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(party))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn records(&self, party: Address) -> Result<Vec<WalRecord>, WalError> {
        let path = self.path_for(party);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn clear(&mut self, party: Address, correlation: &CorrelationKey) -> Result<(), WalError> {
        let survivors: Vec<WalRecord> = self
            .records(party)?
            .into_iter()
            .filter(|record| record.correlation != *correlation)
            .collect();
        let mut content = String::new();
        for record in &survivors {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        fs::write(self.path_for(party), content)?;
        Ok(())
    }
}

/// Newest record per handshake, the state replay starts from.
pub fn latest_per_handshake(records: Vec<WalRecord>) -> BTreeMap<CorrelationKey, WalRecord> {
    let mut latest = BTreeMap::new();
    for record in records {
        // Later appends win.
        latest.insert(record.correlation, record);
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StateChannel;
    use crate::commitment::{Commitment, SetupCommitment};
    use crate::messages::{ProtocolParams, SetupParams};
    use crate::network::NetworkContext;
    use crate::protocol::CommitmentPurpose;
    use crate::sig::Signer;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// A record the way the engine writes one mid-handshake: the context
    /// holds a working channel copy and a partially signed commitment.
    fn in_flight_record(rng: &mut StdRng, pc: usize, waiting: bool) -> WalRecord {
        let network = NetworkContext {
            app_registry: rng.gen(),
            conditional_transaction: rng.gen(),
            virtual_app_agreement: rng.gen(),
            free_balance_app: rng.gen(),
        };
        let signer = Signer::new(rng);
        let responding: Address = rng.gen();
        let multisig: Address = rng.gen();

        let mut context = Context::new(
            Protocol::Setup,
            Role::Initiator,
            ProtocolParams::Setup(SetupParams {
                initiating: signer.address(),
                responding,
                multisig,
            }),
            signer.address(),
            network,
        );
        let channel = StateChannel::new(multisig, vec![signer.address(), responding])
            .setup_channel(&network)
            .unwrap();
        {
            let free_balance = channel.free_balance_app().unwrap();
            context.push_commitment(
                CommitmentPurpose::Setup,
                Commitment::Setup(SetupCommitment {
                    network,
                    multisig,
                    multisig_owners: channel.multisig_owners().to_vec(),
                    free_balance_id: free_balance.identity_hash().unwrap(),
                    free_balance_terms: free_balance.terms().clone(),
                }),
            );
        }
        let digest = context.commitments[0].digest().unwrap();
        let sig = signer.sign_eth(digest).unwrap();
        context.commitments[0].signatures.insert(signer.address(), sig);
        context.put_channel(channel);

        WalRecord {
            correlation: CorrelationKey::Multisig(multisig),
            protocol: Protocol::Setup,
            role: Role::Initiator,
            pc,
            waiting,
            context,
        }
    }

    #[test]
    fn file_log_reproduces_the_record_exactly() {
        let mut rng = StdRng::seed_from_u64(80);
        let dir = tempfile::tempdir().unwrap();
        let party: Address = rng.gen();
        let record = in_flight_record(&mut rng, 4, true);

        {
            let mut log = FileLog::new(dir.path()).unwrap();
            log.append(party, &record).unwrap();
        }
        // A fresh handle on the same directory sees the identical record,
        // working channel and collected signatures included.
        let log = FileLog::new(dir.path()).unwrap();
        assert_eq!(log.records(party).unwrap(), vec![record]);
    }

    #[test]
    fn clear_only_drops_the_finished_handshake() {
        let mut rng = StdRng::seed_from_u64(81);
        let party: Address = rng.gen();
        let mut log = MemoryLog::new();
        let one = in_flight_record(&mut rng, 2, false);
        let other = in_flight_record(&mut rng, 3, true);
        log.append(party, &one).unwrap();
        log.append(party, &other).unwrap();

        log.clear(party, &one.correlation).unwrap();
        assert_eq!(log.records(party).unwrap(), vec![other]);
    }

    #[test]
    fn newest_record_wins_per_handshake() {
        let mut rng = StdRng::seed_from_u64(82);
        let early = in_flight_record(&mut rng, 1, false);
        let mut late = early.clone();
        late.pc = 3;
        late.waiting = true;
        let unrelated = in_flight_record(&mut rng, 2, true);

        let latest = latest_per_handshake(vec![early.clone(), unrelated.clone(), late.clone()]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&early.correlation], late);
        assert_eq!(latest[&unrelated.correlation], unrelated);
    }

    #[test]
    fn file_log_clear_rewrites_survivors() {
        let mut rng = StdRng::seed_from_u64(83);
        let dir = tempfile::tempdir().unwrap();
        let party: Address = rng.gen();
        let mut log = FileLog::new(dir.path()).unwrap();
        let one = in_flight_record(&mut rng, 1, false);
        let other = in_flight_record(&mut rng, 2, true);
        log.append(party, &one).unwrap();
        log.append(party, &other).unwrap();

        log.clear(party, &one.correlation).unwrap();
        let reopened = FileLog::new(dir.path()).unwrap();
        assert_eq!(reopened.records(party).unwrap(), vec![other]);
    }
}
