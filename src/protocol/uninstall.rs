//! Uninstall: remove an app and return its agreed resolution to the free
//! balance. The single commitment is the free balance advance; the removed
//! app's conditional transfer dies with the dependency nonce bump.
//!
//! M1 initiator -> responder: params + initiator's signature.
//! M2 responder -> initiator: responder's signature.

use super::{CommitmentPurpose, Context, Instruction, Opcode, ProtocolError, Role};
use crate::commitment::{Commitment, SetStateCommitment};

pub(super) fn script(role: Role) -> Option<&'static [Instruction]> {
    match role {
        Role::Initiator => Some(INITIATOR),
        Role::Intermediary => None,
        Role::Responder => Some(RESPONDER),
    }
}

const INITIATOR: &[Instruction] = &[
    Instruction::Transition(uninstall),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m2),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(uninstall),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSend),
];

fn uninstall(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_params()?.clone();
    let channel = ctx.channel(params.multisig)?.clone();

    let app = channel.app(params.app_identity_hash)?;
    if app.is_virtual() {
        return Err(ProtocolError::Validation(
            "virtual apps settle through their own uninstall handshake".into(),
        ));
    }

    let next = channel.uninstall_app(params.app_identity_hash, &params.increments)?;
    let free_balance = next.free_balance_app()?;
    ctx.push_commitment(
        CommitmentPurpose::FreeBalanceUpdate,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: free_balance.identity_hash()?,
            state_hash: free_balance.state_hash()?,
            version_number: free_balance.version_number(),
            timeout: free_balance.timeout(),
        }),
    );

    ctx.target_app = Some(params.app_identity_hash);
    ctx.put_channel(next);
    Ok(())
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::FreeBalanceUpdate)?;
    let msg = ctx.compose(1, params.responding, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_params()?.clone();
    let sig = ctx.expect_message(-2)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::FreeBalanceUpdate,
        params.responding,
        sig.as_ref(),
    )
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_params()?.clone();
    let sig = ctx.expect_message(1)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::FreeBalanceUpdate,
        params.initiating,
        sig.as_ref(),
    )
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.uninstall_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::FreeBalanceUpdate)?;
    let msg = ctx.compose(-2, params.initiating, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}
