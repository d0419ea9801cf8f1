use clap::Command;

pub(super) const RUN: &str = "run";
pub(super) const CHECK_CONFIG: &str = "check-config";

pub(super) fn root_cli() -> Command {
    Command::new("clickflow")
        .about("Enriches click events with geolocation and writes them to Postgres and Kafka")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
        .subcommand(add_check_config_subcommand())
}

fn add_run_subcommand() -> Command {
    Command::new(RUN).about("Runs the job until the input ends or a shutdown signal arrives")
}

fn add_check_config_subcommand() -> Command {
    Command::new(CHECK_CONFIG).about("Validates the configuration from the environment and exits")
}
