pub mod providers;
pub mod router;

pub use providers::{
    CompanyInfo, DataProvider, Financials, History, HistoryBar, Quote, SymbolMatch,
};
pub use router::ProviderRouter;
