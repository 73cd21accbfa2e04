//! Payout transaction construction and signing.
//!
//! One recipient output, an optional change output back to the vault
//! (omitted at or below the dust limit), and a witness matching the vault
//! address type. UTXO selection is deliberately simple: first single UTXO
//! that covers the target, else all of them together, else insufficient
//! funds.

use bitcoin::{
    absolute,
    consensus::encode::serialize_hex,
    hashes::Hash,
    key::TapTweak,
    script::PushBytesBuf,
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    transaction, Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
};
use secp256k1::{Keypair, Message, Secp256k1};

use crate::{
    error::{Error, Result},
    explorer::types::Utxo,
    store::models::AddressKind,
};

/// UTXOs chosen to fund a payout.
#[derive(Clone, Debug)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub total: u64,
}

/// First-fit, then combine: a single UTXO covering `target` wins;
/// otherwise every UTXO is spent together when their sum suffices.
pub fn select_utxos(available: &[Utxo], target: u64) -> Result<Selection> {
    if let Some(utxo) = available.iter().find(|u| u.value >= target) {
        return Ok(Selection {
            utxos: vec![utxo.clone()],
            total: utxo.value,
        });
    }
    let total: u64 = available.iter().map(|u| u.value).sum();
    if total >= target {
        return Ok(Selection {
            utxos: available.to_vec(),
            total,
        });
    }
    Err(Error::InsufficientFunds {
        needed: target,
        available: total,
    })
}

/// Everything needed to build and sign one payout.
pub struct PayoutParams<'a> {
    /// Decrypted WIF of the vault key; the caller owns the buffer and
    /// zeroizes it when this borrow ends.
    pub wif: &'a str,
    pub vault_address: &'a str,
    pub address_kind: AddressKind,
    pub recipient: &'a str,
    pub amount: u64,
    pub fee: u64,
    pub dust_limit: u64,
    pub network: Network,
    pub utxos: &'a [Utxo],
}

/// A signed transaction ready for broadcast.
#[derive(Clone, Debug)]
pub struct BuiltTx {
    pub tx: Transaction,
    pub raw_hex: String,
    /// Actual fee paid: inputs − recipient − change.
    pub fee: u64,
    pub change: u64,
}

/// Builds and signs the payout transaction.
pub fn build_signed_payout(params: &PayoutParams<'_>) -> Result<BuiltTx> {
    let secp = Secp256k1::new();
    let private_key = PrivateKey::from_wif(params.wif)
        .map_err(|_| Error::integrity("decrypted vault key is not valid WIF"))?;

    let vault_address = parse_address(params.vault_address, params.network)
        .map_err(|e| Error::integrity(format!("vault address unusable: {e}")))?;
    let recipient = parse_address(params.recipient, params.network)
        .map_err(|e| Error::user(format!("recipient address unusable: {e}")))?;

    let total_input: u64 = params.utxos.iter().map(|u| u.value).sum();
    let needed = params.amount + params.fee;
    if total_input < needed {
        return Err(Error::InsufficientFunds {
            needed,
            available: total_input,
        });
    }

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(params.amount),
        script_pubkey: recipient.script_pubkey(),
    }];
    let mut change = total_input - params.amount - params.fee;
    if change <= params.dust_limit {
        // Dust-sized change is left to the miners.
        change = 0;
    } else {
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: vault_address.script_pubkey(),
        });
    }

    let inputs: Vec<TxIn> = params
        .utxos
        .iter()
        .map(|utxo| TxIn {
            previous_output: OutPoint {
                txid: utxo.txid,
                vout: utxo.vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();

    let mut tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs,
        output: outputs,
    };

    let spent_script = vault_address.script_pubkey();
    match params.address_kind {
        AddressKind::Segwit => sign_p2wpkh(&secp, &mut tx, params, &private_key, &spent_script)?,
        AddressKind::Legacy => sign_p2pkh(&secp, &mut tx, params, &private_key, &spent_script)?,
        AddressKind::Taproot => sign_p2tr(&secp, &mut tx, params, &private_key, &spent_script)?,
    }

    let raw_hex = serialize_hex(&tx);
    Ok(BuiltTx {
        raw_hex,
        fee: total_input - params.amount - change,
        change,
        tx,
    })
}

fn parse_address(raw: &str, network: Network) -> std::result::Result<Address, String> {
    raw.parse::<Address<_>>()
        .map_err(|e| e.to_string())?
        .require_network(network)
        .map_err(|e| e.to_string())
}

fn sign_p2wpkh(
    secp: &Secp256k1<secp256k1::All>,
    tx: &mut Transaction,
    params: &PayoutParams<'_>,
    private_key: &PrivateKey,
    spent_script: &ScriptBuf,
) -> Result<()> {
    let compressed = CompressedPublicKey::from_private_key(secp, private_key)
        .map_err(|_| Error::integrity("vault key is not compressed"))?;

    let mut witnesses = Vec::with_capacity(tx.input.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for (index, utxo) in params.utxos.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    spent_script,
                    Amount::from_sat(utxo.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| Error::integrity(format!("sighash: {e}")))?;
            let signature = bitcoin::ecdsa::Signature {
                signature: secp
                    .sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &private_key.inner),
                sighash_type: EcdsaSighashType::All,
            };
            witnesses.push(Witness::p2wpkh(&signature, &compressed.0));
        }
    }
    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(())
}

fn sign_p2pkh(
    secp: &Secp256k1<secp256k1::All>,
    tx: &mut Transaction,
    params: &PayoutParams<'_>,
    private_key: &PrivateKey,
    spent_script: &ScriptBuf,
) -> Result<()> {
    let public_key = private_key.public_key(secp);

    let mut script_sigs = Vec::with_capacity(tx.input.len());
    {
        let cache = SighashCache::new(&*tx);
        for index in 0..params.utxos.len() {
            let sighash = cache
                .legacy_signature_hash(index, spent_script, EcdsaSighashType::All.to_u32())
                .map_err(|e| Error::integrity(format!("sighash: {e}")))?;
            let signature = secp
                .sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &private_key.inner);

            let mut sig_bytes = signature.serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All as u8);
            let sig_push = PushBytesBuf::try_from(sig_bytes)
                .map_err(|_| Error::integrity("signature exceeds push size"))?;
            script_sigs.push(
                bitcoin::script::Builder::new()
                    .push_slice(sig_push)
                    .push_key(&public_key)
                    .into_script(),
            );
        }
    }
    for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }
    Ok(())
}

fn sign_p2tr(
    secp: &Secp256k1<secp256k1::All>,
    tx: &mut Transaction,
    params: &PayoutParams<'_>,
    private_key: &PrivateKey,
    spent_script: &ScriptBuf,
) -> Result<()> {
    let keypair = Keypair::from_secret_key(secp, &private_key.inner);
    let tweaked = keypair.tap_tweak(secp, None);

    let prevouts: Vec<TxOut> = params
        .utxos
        .iter()
        .map(|utxo| TxOut {
            value: Amount::from_sat(utxo.value),
            script_pubkey: spent_script.clone(),
        })
        .collect();

    let mut witnesses = Vec::with_capacity(tx.input.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for index in 0..params.utxos.len() {
            let sighash = cache
                .taproot_key_spend_signature_hash(
                    index,
                    &Prevouts::All(&prevouts),
                    TapSighashType::Default,
                )
                .map_err(|e| Error::integrity(format!("sighash: {e}")))?;
            let signature = bitcoin::taproot::Signature {
                signature: secp.sign_schnorr(
                    &Message::from_digest(sighash.to_byte_array()),
                    &tweaked.to_inner(),
                ),
                sighash_type: TapSighashType::Default,
            };
            witnesses.push(Witness::p2tr_key_spend(&signature));
        }
    }
    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::consensus::encode::deserialize_hex;
    use secp256k1::SecretKey;

    fn utxo(n: u8, value: u64) -> Utxo {
        Utxo {
            txid: bitcoin::Txid::from_byte_array([n; 32]),
            vout: 0,
            value,
            status: Default::default(),
        }
    }

    #[test]
    fn first_fit_prefers_a_single_utxo() {
        let utxos = vec![utxo(1, 5_000), utxo(2, 30_000), utxo(3, 50_000)];
        let selection = select_utxos(&utxos, 21_000).unwrap();
        assert_eq!(selection.utxos.len(), 1);
        assert_eq!(selection.total, 30_000);
    }

    #[test]
    fn combines_when_no_single_utxo_suffices() {
        let utxos = vec![utxo(1, 9_000), utxo(2, 8_000), utxo(3, 7_000)];
        let selection = select_utxos(&utxos, 21_000).unwrap();
        assert_eq!(selection.utxos.len(), 3);
        assert_eq!(selection.total, 24_000);
    }

    #[test]
    fn insufficient_funds_reports_totals() {
        let err = select_utxos(&[utxo(1, 500)], 21_000).unwrap_err();
        match err {
            Error::InsufficientFunds { needed, available } => {
                assert_eq!(needed, 21_000);
                assert_eq!(available, 500);
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
        assert!(select_utxos(&[], 1).is_err());
    }

    struct Fixture {
        wif: String,
        vault_address: String,
        recipient: String,
        kind: AddressKind,
    }

    fn fixture(kind: AddressKind) -> Fixture {
        let secp = Secp256k1::new();
        let key = PrivateKey::new(
            SecretKey::new(&mut secp256k1::rand::thread_rng()),
            Network::Testnet,
        );
        let vault_address = match kind {
            AddressKind::Legacy => Address::p2pkh(key.public_key(&secp), Network::Testnet),
            AddressKind::Segwit => Address::p2wpkh(
                &CompressedPublicKey::from_private_key(&secp, &key).unwrap(),
                Network::Testnet,
            ),
            AddressKind::Taproot => {
                let keypair = Keypair::from_secret_key(&secp, &key.inner);
                Address::p2tr(&secp, keypair.x_only_public_key().0, None, Network::Testnet)
            }
        };
        let recipient_key = PrivateKey::new(
            SecretKey::new(&mut secp256k1::rand::thread_rng()),
            Network::Testnet,
        );
        let recipient = Address::p2wpkh(
            &CompressedPublicKey::from_private_key(&secp, &recipient_key).unwrap(),
            Network::Testnet,
        );
        Fixture {
            wif: key.to_wif(),
            vault_address: vault_address.to_string(),
            recipient: recipient.to_string(),
            kind,
        }
    }

    fn build(fixture: &Fixture, utxos: &[Utxo], amount: u64, fee: u64) -> BuiltTx {
        build_signed_payout(&PayoutParams {
            wif: &fixture.wif,
            vault_address: &fixture.vault_address,
            address_kind: fixture.kind,
            recipient: &fixture.recipient,
            amount,
            fee,
            dust_limit: 546,
            network: Network::Testnet,
            utxos,
        })
        .unwrap()
    }

    #[test]
    fn segwit_payout_pays_recipient_and_change() {
        let fixture = fixture(AddressKind::Segwit);
        let built = build(&fixture, &[utxo(1, 50_000)], 20_000, 250);

        assert_eq!(built.tx.input.len(), 1);
        assert_eq!(built.tx.output.len(), 2);
        assert_eq!(built.tx.output[0].value, Amount::from_sat(20_000));
        assert_eq!(built.change, 29_750);
        assert_eq!(built.fee, 250);
        assert!(!built.tx.input[0].witness.is_empty());

        // The hex round-trips to the same transaction.
        let decoded: Transaction = deserialize_hex(&built.raw_hex).unwrap();
        assert_eq!(decoded.compute_txid(), built.tx.compute_txid());
    }

    #[test]
    fn dust_change_is_absorbed_into_the_fee() {
        let fixture = fixture(AddressKind::Segwit);
        let built = build(&fixture, &[utxo(1, 20_600)], 20_000, 250);
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.change, 0);
        assert_eq!(built.fee, 600); // declared fee plus the dust
    }

    #[test]
    fn legacy_payout_carries_script_sigs() {
        let fixture = fixture(AddressKind::Legacy);
        let built = build(&fixture, &[utxo(1, 30_000), utxo(2, 30_000)], 45_000, 250);
        assert_eq!(built.tx.input.len(), 2);
        assert!(built.tx.input.iter().all(|i| !i.script_sig.is_empty()));
        assert!(built.tx.input.iter().all(|i| i.witness.is_empty()));
    }

    #[test]
    fn taproot_payout_uses_key_spend_witness() {
        let fixture = fixture(AddressKind::Taproot);
        let built = build(&fixture, &[utxo(1, 40_000)], 30_000, 250);
        assert_eq!(built.tx.input[0].witness.len(), 1);
        // Schnorr signature with default sighash serializes to 64 bytes.
        assert_eq!(built.tx.input[0].witness.iter().next().unwrap().len(), 64);
    }

    #[test]
    fn refuses_to_overspend() {
        let fixture = fixture(AddressKind::Segwit);
        let err = build_signed_payout(&PayoutParams {
            wif: &fixture.wif,
            vault_address: &fixture.vault_address,
            address_kind: fixture.kind,
            recipient: &fixture.recipient,
            amount: 50_000,
            fee: 250,
            dust_limit: 546,
            network: Network::Testnet,
            utxos: &[utxo(1, 10_000)],
        })
        .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
    }
}
