//! Install: move deposits out of the free balance and into a new app.
//!
//! Two commitments travel together: the free balance update that pays for
//! the app and the conditional transfer that funds it on-chain if needed.
//!
//! M1 initiator -> responder: params + initiator's two signatures.
//! M2 responder -> initiator: responder's two signatures.

use super::{CommitmentPurpose, Context, Instruction, Opcode, ProtocolError, Role};
use crate::commitment::{Commitment, ConditionalTransferCommitment, SetStateCommitment};

pub(super) fn script(role: Role) -> Option<&'static [Instruction]> {
    match role {
        Role::Initiator => Some(INITIATOR),
        Role::Intermediary => None,
        Role::Responder => Some(RESPONDER),
    }
}

const INITIATOR: &[Instruction] = &[
    Instruction::Transition(install),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m2),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(install),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSend),
];

/// Derive the new app, apply the install to the working copy and build
/// both commitments from the resulting state.
fn install(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_params()?.clone();
    let channel = ctx.channel(params.multisig)?.clone();

    let app = params.app_instance(channel.num_installed_apps());
    let id = app.identity_hash()?;
    let salt = app.dependency_nonce_salt();
    let next = channel.install_app(app, &params.decrements)?;

    let free_balance = next.free_balance_app()?;
    let free_balance_id = free_balance.identity_hash()?;
    ctx.push_commitment(
        CommitmentPurpose::FreeBalanceUpdate,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: free_balance_id,
            state_hash: free_balance.state_hash()?,
            version_number: free_balance.version_number(),
            timeout: free_balance.timeout(),
        }),
    );
    ctx.push_commitment(
        CommitmentPurpose::ConditionalTransfer,
        Commitment::ConditionalTransfer(ConditionalTransferCommitment {
            network: ctx.network,
            multisig: next.multisig_address(),
            multisig_owners: next.multisig_owners().to_vec(),
            app_identity_hash: id,
            free_balance_id,
            dependency_nonce_salt: salt,
            terms: params.terms.clone(),
        }),
    );

    ctx.target_app = Some(id);
    ctx.put_channel(next);
    Ok(())
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_params()?.clone();
    let balance_sig = ctx.our_signature(CommitmentPurpose::FreeBalanceUpdate)?;
    let transfer_sig = ctx.our_signature(CommitmentPurpose::ConditionalTransfer)?;
    let msg = ctx.compose(
        1,
        params.responding,
        [Some(balance_sig), Some(transfer_sig), None],
    );
    ctx.send(msg);
    Ok(())
}

fn handle_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_params()?.clone();
    let msg = ctx.expect_message(-2)?;
    let (balance_sig, transfer_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::FreeBalanceUpdate,
        params.responding,
        balance_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::ConditionalTransfer,
        params.responding,
        transfer_sig.as_ref(),
    )
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_params()?.clone();
    let msg = ctx.expect_message(1)?;
    let (balance_sig, transfer_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::FreeBalanceUpdate,
        params.initiating,
        balance_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::ConditionalTransfer,
        params.initiating,
        transfer_sig.as_ref(),
    )
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_params()?.clone();
    let balance_sig = ctx.our_signature(CommitmentPurpose::FreeBalanceUpdate)?;
    let transfer_sig = ctx.our_signature(CommitmentPurpose::ConditionalTransfer)?;
    let msg = ctx.compose(
        -2,
        params.initiating,
        [Some(balance_sig), Some(transfer_sig), None],
    );
    ctx.send(msg);
    Ok(())
}
