//! # TrustME coordination: BFT finality over a unit DAG
//!
//! Ordinary proof-of-work units enter the DAG freely; finality comes from
//! TrustME marker units agreed on by a fixed committee of ten witnesses.
//!
//! ## Design
//!
//! 1. **One instance per main-chain index.** A consensus height names the
//!    next main-chain index to fill. Deciding it picks the unit whose commit
//!    stabilizes everything that unit can reach in the DAG.
//!
//! 2. **Phased voting.** Each height runs numbered phases of a
//!    propose / prevote / precommit exchange. A rotating coordinator proposes
//!    a candidate unit; seven of the ten witnesses prevoting it locks it,
//!    seven precommits decide it. Timeouts grow with the phase number, so
//!    under any bounded delay some phase eventually completes.
//!
//! 3. **Evidence travels in the unit.** Precommit signatures are collected
//!    into the decided unit itself as TrustME evidence before it is
//!    committed, so any node can audit finality from the ledger alone with
//!    no separate vote store.
//!
//! 4. **Witnesses come from the DAG.** Each round's committee is elected
//!    from the authors of stable proof-of-work units of the previous round,
//!    plus the foundation. Doing work in round r buys a seat in round r+1.
//!
//! ## Message flow
//!
//! ```text
//! Height h, phase p:
//!   1. coordinator(h, p) broadcasts Proposal(v) and its own Prevote(id(v))
//!   2. witnesses validate v against their ledger, Prevote id(v) or nil
//!   3. 7 prevotes for id(v): lock v, broadcast signed Precommit(id(v))
//!   4. 7 precommits for id(v): decided; the author of v embeds the
//!      precommit signatures as evidence, re-signs and commits the unit
//!   5. the commit stabilizes v's ancestor closure; stability advances
//!      every engine to height h+1
//!   failure at any stage: phase p+1, same height, a new coordinator
//! ```
//!
//! Locks guarantee two phases can never decide different units at one
//! height; the valid-value rule lets a later coordinator re-propose a unit
//! that already gathered a prevote quorum so progress is never thrown away.

pub mod composer;
pub mod engine;
pub mod messages;
pub mod state;
