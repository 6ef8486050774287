//! Recipe Worker Service - Entry Point
//!
//! Background worker that drains the note/ingredient/instruction/
//! categorization/pattern queues and runs the recipe-import pipelines.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    recipe_worker::run().await
}
