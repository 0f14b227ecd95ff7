use anyhow::Result;
use lockscope::cli::{actions, actions::Action, start, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    let outcome = match action {
        Action::Analyze(opts) => actions::analyze::handle(*opts).await,
        Action::Backends => actions::backends::handle(),
    };

    telemetry::shutdown();

    outcome
}
