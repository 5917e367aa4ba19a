//! Setup: two parties install the initial free balance behind a fresh
//! multisig.
//!
//! M1 initiator -> responder: params + initiator's setup signature.
//! M2 responder -> initiator: responder's setup signature.

use super::{CommitmentPurpose, Context, Instruction, Opcode, ProtocolError, Role};
use crate::channel::StateChannel;
use crate::commitment::{Commitment, SetupCommitment};

pub(super) fn script(role: Role) -> Option<&'static [Instruction]> {
    match role {
        Role::Initiator => Some(INITIATOR),
        Role::Intermediary => None,
        Role::Responder => Some(RESPONDER),
    }
}

const INITIATOR: &[Instruction] = &[
    Instruction::Transition(create_channel),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m2),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(create_channel),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSend),
];

/// Both sides derive the same fresh channel and the same commitment.
fn create_channel(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.setup_params()?.clone();
    if ctx.channels.contains_key(&params.multisig) {
        return Err(ProtocolError::ChannelExists(params.multisig));
    }

    let channel = StateChannel::new(params.multisig, vec![params.initiating, params.responding])
        .setup_channel(&ctx.network)?;

    let free_balance = channel.free_balance_app()?;
    ctx.push_commitment(
        CommitmentPurpose::Setup,
        Commitment::Setup(SetupCommitment {
            network: ctx.network,
            multisig: channel.multisig_address(),
            multisig_owners: channel.multisig_owners().to_vec(),
            free_balance_id: free_balance.identity_hash()?,
            free_balance_terms: free_balance.terms().clone(),
        }),
    );
    ctx.put_channel(channel);
    Ok(())
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.setup_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::Setup)?;
    let msg = ctx.compose(1, params.responding, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.setup_params()?.clone();
    let sig = ctx.expect_message(-2)?.signature;
    ctx.validate_commitment_signature(CommitmentPurpose::Setup, params.responding, sig.as_ref())
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.setup_params()?.clone();
    let sig = ctx.expect_message(1)?.signature;
    ctx.validate_commitment_signature(CommitmentPurpose::Setup, params.initiating, sig.as_ref())
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.setup_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::Setup)?;
    let msg = ctx.compose(-2, params.initiating, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}
