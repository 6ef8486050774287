//! Concrete action sequences per stage (spec §4.11 / C11). Each module
//! registers its actions in the exact order spec.md pins down, since
//! registration order is pipeline composition order (job-actions::ActionFactory).

pub mod categorization;
pub mod ingredient;
pub mod instruction;
pub mod note;
pub mod pattern;

use job_actions::{Action, ActionContext, ActionFactory, ActionName, BaseAction, Dependencies};
use job_errors::JobError;

/// Runs every action in `factory`'s registered order against `payload`,
/// each action's output feeding the next (spec §4.4: "within a single
/// job, actions execute serially and deterministically in registration
/// order"). `DETERMINE_TAGS` is the one action whose contract requires
/// broadcaster errors to propagate (§4.3 exception) — it broadcasts
/// inline and is run with the `BaseAction` wrapper's own broadcasting
/// disabled so the two don't double-emit.
pub(crate) async fn run_pipeline<P>(
    factory: &ActionFactory<P>,
    mut payload: P,
    deps: &Dependencies,
    ctx: &ActionContext,
) -> Result<P, JobError>
where
    P: Send + Sync,
{
    for name in factory.registered_order() {
        let action = factory
            .create(*name)
            .unwrap_or_else(|| panic!("action {name} registered without a constructor"));
        payload = run_one(action, *name, payload, deps, ctx).await?;
    }
    Ok(payload)
}

async fn run_one<P: Send + Sync>(
    action: Box<dyn Action<Payload = P>>,
    name: ActionName,
    payload: P,
    deps: &Dependencies,
    ctx: &ActionContext,
) -> Result<P, JobError> {
    if name == ActionName::DetermineTags {
        BaseAction::new(Boxed(action)).without_status_broadcast().run(payload, deps, ctx).await
    } else {
        BaseAction::new(Boxed(action)).run(payload, deps, ctx).await
    }
}

/// Adapts an owned `Box<dyn Action<Payload = P>>` back into something
/// `BaseAction` can wrap by value, since `BaseAction::new` takes `A: Action`
/// rather than a trait object directly.
struct Boxed<P>(Box<dyn Action<Payload = P>>);

#[async_trait::async_trait]
impl<P: Send + Sync> Action for Boxed<P> {
    type Payload = P;

    fn name(&self) -> ActionName {
        self.0.name()
    }

    fn validate_input(&self, payload: &P) -> Result<(), JobError> {
        self.0.validate_input(payload)
    }

    async fn execute(&self, payload: P, deps: &Dependencies, ctx: &ActionContext) -> Result<P, JobError> {
        self.0.execute(payload, deps, ctx).await
    }
}
