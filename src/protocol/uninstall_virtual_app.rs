//! Uninstall a virtual app: pin its final state, then settle the two
//! funding agreements one after the other.
//!
//! The lock phase (M1..M4) collects all three signatures over the final
//! state hash so no further update can race the settlement. The
//! settlement phases advance each real channel's free balance; the
//! intermediary signs the left and right settlements independently and
//! relays signatures, never application state.
//!
//! M1 initiator -> intermediary: lock signature.
//! M2 intermediary -> responder: relayed + own lock signatures.
//! M3 responder -> intermediary: lock signature.
//! M4 intermediary -> initiator: own + relayed lock signatures.
//! M5 initiator -> intermediary: left settlement signature.
//! M6 intermediary -> initiator: left settlement signature.
//! M7 intermediary -> responder: right settlement signature.
//! M8 responder -> intermediary: right settlement signature.

use super::{CommitmentPurpose, Context, Instruction, Opcode, ProtocolError, Role};
use crate::abiencode::types::{Address, U256};
use crate::channel::StateChannel;
use crate::commitment::{Commitment, SetStateCommitment};
use std::collections::BTreeMap;

pub(super) fn script(role: Role) -> Option<&'static [Instruction]> {
    match role {
        Role::Initiator => Some(INITIATOR),
        Role::Intermediary => Some(INTERMEDIARY),
        Role::Responder => Some(RESPONDER),
    }
}

const INITIATOR: &[Instruction] = &[
    Instruction::Transition(lock_initiator),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m4),
    Instruction::Transition(settle_left_initiator),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m5),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m6),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const INTERMEDIARY: &[Instruction] = &[
    Instruction::Transition(lock_intermediary),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSignAsIntermediary),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m3),
    Instruction::Transition(send_m4),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(settle_left_intermediary),
    Instruction::Op(Opcode::OpSignAsIntermediary),
    Instruction::Transition(send_m6),
    Instruction::Op(Opcode::IoSend),
    Instruction::Transition(settle_right_intermediary),
    Instruction::Op(Opcode::OpSignAsIntermediary),
    Instruction::Transition(send_m7),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m8),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(lock_responder),
    Instruction::Transition(verify_m2),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m3),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(settle_right_responder),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m8),
    Instruction::Op(Opcode::IoSend),
];

/// The commitment pinning the app at its final state.
fn push_lock(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    ctx.push_commitment(
        CommitmentPurpose::VirtualAppSetState,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: params.target,
            state_hash: params.final_state_hash,
            version_number: params.final_version_number,
            timeout: params.lock_timeout,
        }),
    );
    ctx.target_app = Some(params.target);
    Ok(())
}

/// Free balance advance settling one real channel's agreement.
fn push_settlement(
    ctx: &mut Context,
    purpose: CommitmentPurpose,
    channel: StateChannel,
    increments: &BTreeMap<Address, U256>,
) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let settled = channel.remove_virtual_app(params.target, increments)?;
    let free_balance = settled.free_balance_app()?;
    ctx.push_commitment(
        purpose,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: free_balance.identity_hash()?,
            state_hash: free_balance.state_hash()?,
            version_number: free_balance.version_number(),
            timeout: free_balance.timeout(),
        }),
    );
    ctx.put_channel(settled);
    Ok(())
}

fn lock_initiator(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();
    let locked = left.lock_app_instance(params.target)?;
    ctx.put_channel(locked);
    push_lock(ctx)
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let msg = ctx.compose(1, params.intermediary, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m4(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let msg = ctx.expect_message(-4)?;
    let (intermediary_sig, responder_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.intermediary,
        intermediary_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.responding,
        responder_sig.as_ref(),
    )
}

fn settle_left_initiator(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();
    push_settlement(
        ctx,
        CommitmentPurpose::LeftSettlement,
        left,
        &params.left_increments,
    )
}

fn send_m5(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::LeftSettlement)?;
    let msg = ctx.compose(5, params.intermediary, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m6(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.expect_message(-6)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::LeftSettlement,
        params.intermediary,
        sig.as_ref(),
    )
}

fn lock_intermediary(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    // Both agreements must exist before anything is signed; lock the app
    // in both working copies, same as the endpoints do in theirs.
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();
    left.virtual_agreement(params.target)?;
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();
    right.virtual_agreement(params.target)?;
    ctx.put_channel(left.lock_app_instance(params.target)?);
    ctx.put_channel(right.lock_app_instance(params.target)?);
    push_lock(ctx)
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.expect_message(1)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.initiating,
        sig.as_ref(),
    )
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let relayed = ctx.signature_of(CommitmentPurpose::VirtualAppSetState, params.initiating)?;
    let own = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let msg = ctx.compose(2, params.responding, [Some(relayed), Some(own), None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m3(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.expect_message(-3)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.responding,
        sig.as_ref(),
    )
}

fn send_m4(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let own = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let relayed = ctx.signature_of(CommitmentPurpose::VirtualAppSetState, params.responding)?;
    let msg = ctx.compose(-4, params.initiating, [Some(own), Some(relayed), None]);
    ctx.send(msg);
    Ok(())
}

fn settle_left_intermediary(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();
    push_settlement(
        ctx,
        CommitmentPurpose::LeftSettlement,
        left,
        &params.left_increments,
    )?;
    // M5 arrived before this step built the commitment; validate now.
    let sig = ctx.expect_message(5)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::LeftSettlement,
        params.initiating,
        sig.as_ref(),
    )
}

fn send_m6(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::LeftSettlement)?;
    let msg = ctx.compose(-6, params.initiating, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn settle_right_intermediary(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();
    push_settlement(
        ctx,
        CommitmentPurpose::RightSettlement,
        right,
        &params.right_increments,
    )
}

fn send_m7(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::RightSettlement)?;
    let msg = ctx.compose(7, params.responding, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m8(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.expect_message(-8)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::RightSettlement,
        params.responding,
        sig.as_ref(),
    )
}

fn lock_responder(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();
    let locked = right.lock_app_instance(params.target)?;
    ctx.put_channel(locked);
    push_lock(ctx)
}

fn verify_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let msg = ctx.expect_message(2)?;
    let (initiator_sig, intermediary_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.initiating,
        initiator_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.intermediary,
        intermediary_sig.as_ref(),
    )
}

fn send_m3(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let msg = ctx.compose(-3, params.intermediary, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn settle_right_responder(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();
    push_settlement(
        ctx,
        CommitmentPurpose::RightSettlement,
        right,
        &params.right_increments,
    )?;
    // M7 arrived before this step built the commitment; validate now.
    let sig = ctx.expect_message(7)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::RightSettlement,
        params.intermediary,
        sig.as_ref(),
    )
}

fn send_m8(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_virtual_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::RightSettlement)?;
    let msg = ctx.compose(-8, params.intermediary, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}
