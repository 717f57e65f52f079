fn main() -> anyhow::Result<()> {
    rdiffvault::cli::run()
}
