/// This test should FAIL to compile
/// A game cannot play a round before its teams are registered

use bidbox::game::{Game, GameManifest};
use bidbox::GameConfig;

fn main() {
    let manifest: GameManifest = serde_json::from_str("{}").unwrap();
    let game = Game::new(GameConfig::default(), manifest).unwrap();

    // This should fail: play_round only exists on Game<Running>
    game.play_round();
}
