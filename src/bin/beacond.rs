//! beacon daemon binary.
//!
//! See [`beacond::cli`] for usage.

fn main() -> anyhow::Result<()> {
    beacond::cli::main()
}
