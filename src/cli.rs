/// CLI argument parsing

use clap::Parser;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "volcop")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Container whose named volumes should be backed up (id or name)
    pub container: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_id() {
        let cli = Cli::parse_from(["volcop", "c1"]);
        assert_eq!(cli.container, "c1");
    }

    #[test]
    fn test_container_id_is_required() {
        assert!(Cli::try_parse_from(["volcop"]).is_err());
    }
}
