use anyhow::Result;
use clap::{command, Arg, ArgMatches, Command};
use crddemo_operator::{
    kube::{api::ListParams, Api, Client},
    CustomResourceExt, Mydemo,
};
use tabled::{Style, Table};

mod mydemo;

use mydemo::MydemoOut;

fn crd(_matches: &ArgMatches) -> Result<()> {
    let crd = serde_yaml::to_string(&Mydemo::crd())?;
    println!("{}", crd);
    Ok(())
}

async fn list(matches: &ArgMatches) -> Result<()> {
    let client = Client::try_default().await?;
    let mydemos: Api<Mydemo> = match matches.get_one::<String>("namespace") {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let rows = mydemos
        .list(&ListParams::default())
        .await?
        .into_iter()
        .map(MydemoOut::new);
    let table = Table::new(rows).with(Style::blank()).to_string();
    println!("{}", table);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = command!()
        .subcommand_required(true)
        .subcommand(Command::new("crd").about("Print crddemo CRDs"))
        .subcommand(
            Command::new("list").about("List Mydemo resources").arg(
                Arg::new("namespace")
                    .short('n')
                    .long("namespace")
                    .env("CRDDEMO_NAMESPACE")
                    .help("Only list resources in this namespace"),
            ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("crd", crd_matches)) => crd(crd_matches),
        Some(("list", list_matches)) => list(list_matches).await,
        _ => unreachable!("subcommand is required"),
    }
}
