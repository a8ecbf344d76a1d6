use crate::catalogue;
use crate::cli::GraphArgs;
use crate::config::PartialRunConfig;
use crate::error::Result;
use tracing::info;

pub fn run(args: GraphArgs) -> Result<()> {
    let request =
        PartialRunConfig::from_file(&args.source.config)?.into_request(&args.source.set_values)?;
    let registries = catalogue::rollcall()?;
    let graph = registries.resolver().resolve(&request)?;
    info!(
        functors = graph.node_count(),
        edges = graph.edge_count(),
        "Dependency graph resolved."
    );

    if args.dot {
        print!("{}", graph.to_dot());
        return Ok(());
    }

    print!("{}", graph.describe_order());
    let backends = graph.required_backends();
    if !backends.is_empty() {
        println!("\nRequired backends:");
        for (backend, version) in backends {
            println!("  {backend} v{version}");
        }
    }
    Ok(())
}
