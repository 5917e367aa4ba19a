//! Update (take action): advance one app's state by exactly one version.
//!
//! The engine signs states, it does not execute app logic; the caller
//! supplies the successor state (computed against the app definition
//! contract) and the counterparty checks it before countersigning.
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
    Instruction::Transition(advance_state),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m2),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(advance_state),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSend),
];

fn advance_state(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.update_params()?.clone();
    let channel = ctx.channel(params.multisig)?.clone();

    let next = channel.set_app_state(
        params.app_identity_hash,
        params.new_state.clone(),
        params.timeout,
    )?;
    let app = next.app(params.app_identity_hash)?;
    ctx.push_commitment(
        CommitmentPurpose::AppSetState,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: params.app_identity_hash,
            state_hash: app.state_hash()?,
            version_number: app.version_number(),
            timeout: params.timeout,
        }),
    );

    ctx.target_app = Some(params.app_identity_hash);
    ctx.put_channel(next);
    Ok(())
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.update_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::AppSetState)?;
    let msg = ctx.compose(1, params.responding, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}

fn handle_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.update_params()?.clone();
    let sig = ctx.expect_message(-2)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::AppSetState,
        params.responding,
        sig.as_ref(),
    )
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.update_params()?.clone();
    let sig = ctx.expect_message(1)?.signature;
    ctx.validate_commitment_signature(
        CommitmentPurpose::AppSetState,
        params.initiating,
        sig.as_ref(),
    )
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.update_params()?.clone();
    let sig = ctx.our_signature(CommitmentPurpose::AppSetState)?;
    let msg = ctx.compose(-2, params.initiating, [Some(sig), None, None]);
    ctx.send(msg);
    Ok(())
}
