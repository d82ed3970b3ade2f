/// This test should FAIL to compile
/// Attempting to reuse a game after a transition consumed it

use bidbox::game::{Game, GameManifest};
use bidbox::GameConfig;

fn main() {
    let manifest: GameManifest = serde_json::from_str("{}").unwrap();
    let game = Game::new(GameConfig::default(), manifest).unwrap();

    // First transition consumes game
    let _initialized = game.initialize().unwrap();

    // This should fail: game was moved and can no longer be used
    game.initialize();
}
