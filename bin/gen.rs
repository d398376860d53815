use clap::{Arg, Command};
use sirene_ingest::SIRENE_FIELDS;
use std::io::{self, Write};

/// Columns present in real extracts but not needed by the loader.
const EXTRA_FIELDS: [&str; 4] = [
    "statutDiffusionEtablissement",
    "trancheEffectifsEtablissement",
    "activitePrincipaleEtablissement",
    "caractereEmployeurEtablissement",
];

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic establishment extract to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("bom")
                .long("bom")
                .help("Prefix the header with a UTF-8 byte order mark")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(Arg::new("delim").long("delim").default_value(","))
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let bom = matches.get_flag("bom");
    let delim = matches.get_one::<String>("delim").unwrap().as_str();

    let mut out = io::BufWriter::new(io::stdout().lock());

    if bom {
        out.write_all(b"\xEF\xBB\xBF")?;
    }
    // Extra columns interleaved so positions are not simply 0..n
    let mut header: Vec<&str> = Vec::new();
    for (i, field) in SIRENE_FIELDS.into_iter().enumerate() {
        header.push(field);
        if let Some(extra) = EXTRA_FIELDS.get(i) {
            header.push(*extra);
        }
    }
    writeln!(&mut out, "{}", header.join(delim))?;

    // Deterministic values: siren, nic, siret derived from the row number
    for i in 0..rows {
        let siren = 100_000_000 + i;
        let nic = i % 100_000;
        let values = header.iter().map(|name| match *name {
            "siren" => format!("{siren:09}"),
            "nic" => format!("{nic:05}"),
            "siret" => format!("{siren:09}{nic:05}"),
            "dateCreationEtablissement" | "dateDebut" => {
                format!("{}-{:02}-{:02}", 1970 + i % 50, 1 + i % 12, 1 + i % 28)
            }
            "dateDernierTraitementEtablissement" => "2024-01-01T00:00:00".to_string(),
            "codePostalEtablissement" => format!("{:05}", 75_001 + i % 20),
            "codeCommuneEtablissement" => format!("{:05}", 75_101 + i % 20),
            "libelleCommuneEtablissement" => "PARIS".to_string(),
            "typeVoieEtablissement" => "RUE".to_string(),
            "libelleVoieEtablissement" => format!("DE LA PAIX {}", i % 97),
            "etatAdministratifEtablissement" => "A".to_string(),
            _ => format!("x{i}"),
        });
        writeln!(&mut out, "{}", values.collect::<Vec<_>>().join(delim))?;
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
