mod network;
mod quality;
mod session;
mod sync;

use clap::Parser;
use log::info;
use network::{AvatarProfile, Client, ClientConfig};
use shared::{CharacterType, Vec3, WeaponType};
use sync::LogSink;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Character: knight, ranger, mage or rogue
    #[arg(short, long, default_value = "knight")]
    character: String,

    /// Weapon: sword, bow, staff or dagger
    #[arg(short, long, default_value = "sword")]
    weapon: String,

    /// Spawn X coordinate
    #[arg(long, default_value = "0.0")]
    spawn_x: f32,

    /// Spawn Z coordinate
    #[arg(long, default_value = "0.0")]
    spawn_z: f32,
}

fn parse_character(value: &str) -> CharacterType {
    match value.to_lowercase().as_str() {
        "ranger" => CharacterType::Ranger,
        "mage" => CharacterType::Mage,
        "rogue" => CharacterType::Rogue,
        _ => CharacterType::Knight,
    }
}

fn parse_weapon(value: &str) -> WeaponType {
    match value.to_lowercase().as_str() {
        "bow" => WeaponType::Bow,
        "staff" => WeaponType::Staff,
        "dagger" => WeaponType::Dagger,
        _ => WeaponType::Sword,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let profile = AvatarProfile {
        name: args.name,
        character: parse_character(&args.character),
        weapon: parse_weapon(&args.weapon),
        spawn_position: Vec3::new(args.spawn_x, 0.0, args.spawn_z),
    };

    info!("Connecting to: {}", args.server);
    let mut client = Client::new(
        &args.server,
        profile,
        ClientConfig::default(),
        Box::new(LogSink),
    )
    .await?;

    client.run().await?;

    Ok(())
}
