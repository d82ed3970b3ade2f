/// This test should FAIL to compile
/// Skipping registration is impossible

use bidbox::game::{Game, GameManifest};
use bidbox::GameConfig;

fn main() {
    let manifest: GameManifest = serde_json::from_str("{}").unwrap();
    let game = Game::new(GameConfig::default(), manifest).unwrap();

    // This should fail: start only exists on Game<Initialized>
    let _running = game.start();
}
